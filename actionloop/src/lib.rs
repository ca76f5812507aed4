//! Tri-modal OpenWhisk-style action proxy.
//!
//! One runtime binary serves three roles, fixed at construction:
//!
//! - **None** — classic behaviour: host a single user action directly,
//!   speaking the one-line activation protocol over the child's stdio.
//! - **Client** — a pure forwarder: rewrite init/run bodies, stamp them with
//!   the action's code hash and a fresh client identity, and reverse-proxy
//!   them to a server runtime, replaying the remote logs locally.
//! - **Server** — a multiplexer: one child process per distinct code hash,
//!   shared by any number of connected clients, with per-action run queues
//!   and a setup-aware timed reaper for idle actions.
//!
//! # Quick start — local runner
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use actionloop::{ActionProxy, LogSink, Mode};
//!
//! # async fn serve() -> std::io::Result<()> {
//! let proxy = Arc::new(ActionProxy::new(
//!     "./action",
//!     None,
//!     LogSink::stdout()?,
//!     LogSink::stderr()?,
//!     Mode::local(),
//! ));
//! let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8080)).await?;
//! actionloop::http::serve(proxy, listener, std::future::pending()).await
//! # }
//! ```

mod action;
mod error;
mod executor;
mod extract;
mod forward;
pub mod http;
mod logs;
mod registry;
mod reaper;
pub mod stopper;

pub use action::{ActionProxy, LocalState, Mode};
pub use error::{Error, Result};
pub use executor::{ChildExited, Executor};
pub use forward::ClientState;
pub use logs::LogSink;
pub use registry::{Registry, ServerState};
