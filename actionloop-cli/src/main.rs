//! The actionloop runtime binary.
//!
//! One executable, three roles: a local action runner (default), a
//! forwarding client (`OW_ACTIVATE_PROXY_CLIENT=1`), or a multiplexing
//! server (`OW_ACTIVATE_PROXY_SERVER=1`).

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::path::PathBuf;
use std::sync::Arc;

use actionloop::{ActionProxy, LogSink, Mode};
use anyhow::{Context as _, Result, bail};
use clap::Parser;

/// Root for extracted action directories, relative to the working dir.
const ACTION_DIR: &str = "./action";

#[derive(Parser)]
#[command(
    name = "actionloop",
    version,
    about = "OpenWhisk-style action proxy runtime"
)]
struct Cli {
    /// Verbose logging; also allows re-initialization.
    #[arg(long)]
    debug: bool,

    /// Port the HTTP surface listens on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("actionloop: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let debug = cli.debug || env_flag("OW_DEBUG");
    init_tracing(debug);

    let mode = select_mode()?;
    let compiler = std::env::var_os("OW_COMPILER")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    if let Some(compiler) = &compiler {
        tracing::debug!("compiler: {}", compiler.display());
    }

    let proxy = Arc::new(
        ActionProxy::new(
            ACTION_DIR,
            compiler,
            LogSink::stdout()?,
            LogSink::stderr()?,
            mode,
        )
        .with_debug(debug),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("cannot listen on port {}", cli.port))?;
    tracing::info!(
        "actionloop proxy {} listening on port {}",
        env!("CARGO_PKG_VERSION"),
        cli.port
    );

    actionloop::http::serve(
        Arc::clone(&proxy),
        listener,
        actionloop::stopper::shutdown_signal(proxy),
    )
    .await?;
    Ok(())
}

/// Picks the proxy mode from the activation environment variables.
fn select_mode() -> Result<Mode> {
    let client = env_flag("OW_ACTIVATE_PROXY_CLIENT");
    let server = env_flag("OW_ACTIVATE_PROXY_SERVER");
    match (client, server) {
        (true, true) => {
            bail!("OW_ACTIVATE_PROXY_CLIENT and OW_ACTIVATE_PROXY_SERVER are mutually exclusive")
        }
        (true, false) => {
            tracing::debug!("OW_ACTIVATE_PROXY_CLIENT set; running as a forward proxy");
            Ok(Mode::client())
        }
        (false, true) => {
            tracing::debug!("OW_ACTIVATE_PROXY_SERVER set; running as a proxy server");
            Ok(Mode::server())
        }
        (false, false) => Ok(Mode::local()),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let fallback = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}
