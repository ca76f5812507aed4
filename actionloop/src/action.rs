//! The per-runtime action proxy: one instance per process (or per
//! multiplexed server entry), owning the working dirs, the log sinks, and
//! the mode-specific state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use actionloop_proto::InitRequest;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::extract;
use crate::forward::ClientState;
use crate::logs::LogSink;
use crate::registry::ServerState;

/// What a runtime instance is, fixed at construction.
///
/// Modelling the mode as a variant (rather than optional fields checked at
/// runtime) means each request path can only see the state it owns.
#[derive(Debug)]
#[non_exhaustive]
pub enum Mode {
    /// Classic behaviour: host one action directly.
    None(LocalState),
    /// Forward everything to a server runtime.
    Client(ClientState),
    /// Host many actions, one child per code hash.
    Server(ServerState),
}

impl Mode {
    /// A fresh local (None) mode.
    #[must_use]
    pub fn local() -> Self {
        Self::None(LocalState::default())
    }

    /// A fresh client mode.
    #[must_use]
    pub fn client() -> Self {
        Self::Client(ClientState::new())
    }

    /// A fresh server mode configured from the environment.
    #[must_use]
    pub fn server() -> Self {
        Self::Server(ServerState::new())
    }
}

/// State owned by a None-mode runtime: the executor slot.
///
/// The slot's async lock is also what serializes runs: whoever holds it is
/// the only caller interacting with the child.
#[derive(Debug, Default)]
pub struct LocalState {
    executor: Mutex<Option<Executor>>,
}

/// A runtime instance mediating between the platform and a user executable.
#[derive(Debug)]
pub struct ActionProxy {
    /// Root for numbered extraction directories.
    base_dir: PathBuf,
    /// External compiler helper; `None` disables compilation.
    compiler: Option<PathBuf>,
    /// Number of the active extraction directory (0 = none yet).
    current_dir: AtomicUsize,
    /// One-shot init flag; re-init is rejected unless debugging.
    initialized: AtomicBool,
    /// Debug mode: verbose logging, re-init allowed.
    debug: bool,
    /// Stdout sink of the hosted action.
    out: LogSink,
    /// Stderr sink of the hosted action.
    err: LogSink,
    /// Environment installed into the child, accumulated across inits.
    env: StdMutex<HashMap<String, String>>,
    mode: Mode,
}

impl ActionProxy {
    /// Creates a proxy rooted at `base_dir`, resuming the directory
    /// numbering from whatever is already on disk.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        compiler: Option<PathBuf>,
        out: LogSink,
        err: LogSink,
        mode: Mode,
    ) -> Self {
        let base_dir = base_dir.into();
        let current = extract::highest_dir(&base_dir);
        Self {
            base_dir,
            compiler,
            current_dir: AtomicUsize::new(current),
            initialized: AtomicBool::new(false),
            debug: false,
            out,
            err,
            env: StdMutex::new(HashMap::new()),
            mode,
        }
    }

    /// Enables debug mode (verbose logging, re-init allowed).
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The runtime's mode state.
    pub const fn mode(&self) -> &Mode {
        &self.mode
    }

    /// `true` once an init has completed.
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// `true` when re-init is allowed.
    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Root of the numbered extraction directories.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Configured compiler helper, if any.
    pub fn compiler(&self) -> Option<&Path> {
        self.compiler.as_deref()
    }

    /// Stdout sink of the hosted action.
    pub const fn out(&self) -> &LogSink {
        &self.out
    }

    /// Stderr sink of the hosted action.
    pub const fn err(&self) -> &LogSink {
        &self.err
    }

    /// Number of the active extraction directory.
    pub fn current_dir(&self) -> usize {
        self.current_dir.load(Ordering::SeqCst)
    }

    /// The init pipeline for a directly hosted action: decode the payload,
    /// lay it out on disk (compiling if needed), and start the executable.
    ///
    /// Used by None-mode inits and by the server registry for the inner
    /// proxy of each new entry.
    pub async fn do_init(&self, request: &InitRequest) -> Result<()> {
        if request.value.code.is_empty() {
            return Err(Error::Forbidden(
                "Missing main/no code to execute.".to_owned(),
            ));
        }

        self.install_env(&request.value.env);

        let main = if request.value.main.is_empty() {
            "main".to_owned()
        } else {
            request.value.main.clone()
        };

        let payload = if request.value.binary {
            BASE64
                .decode(request.value.code.as_bytes())
                .map_err(|e| Error::BadRequest(format!("cannot decode the request: {e}")))?
        } else {
            request.value.code.clone().into_bytes()
        };

        let base = self.base_dir.clone();
        let compiler = self.compiler.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract::extract_and_compile(&base, &payload, &main, compiler.as_deref())
        })
        .await
        .map_err(|e| Error::Internal(format!("extraction task failed: {e}")))?;

        let n = match extracted {
            Ok((n, _bin)) => n,
            Err(e) => {
                return Err(self.init_failure(
                    &e.to_string(),
                    "The action failed to generate or locate a binary. See logs for details.",
                ));
            }
        };
        self.current_dir.store(n, Ordering::SeqCst);

        if let Err(e) = self.start_latest_action().await {
            return Err(self.init_failure(
                &format!("cannot start action: {e}"),
                "Cannot start action. Check logs for details.",
            ));
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Maps an init failure per the `OW_LOG_INIT_ERROR` policy: by default
    /// the detail goes to the caller; with the variable set it goes to the
    /// action logs (sentinel-bracketed) and the caller gets `generic`.
    fn init_failure(&self, detail: &str, generic: &str) -> Error {
        if std::env::var_os("OW_LOG_INIT_ERROR").is_none() {
            return Error::BadGateway(detail.to_owned());
        }
        if let Err(e) = self.err.write_line(detail) {
            tracing::debug!("cannot write init error to log: {e}");
        }
        self.out.append_guard();
        self.err.append_guard();
        Error::BadGateway(generic.to_owned())
    }

    /// Starts (or restarts) the executable of the highest-numbered action
    /// directory, replacing any previous executor.
    async fn start_latest_action(&self) -> Result<()> {
        let Mode::None(local) = &self.mode else {
            return Err(Error::Internal(
                "only a directly hosted action can be started".to_owned(),
            ));
        };

        let n = self.current_dir.load(Ordering::SeqCst);
        let exec = self.base_dir.join(n.to_string()).join("bin").join("exec");
        tracing::debug!("starting {}", exec.display());

        let env = self.env_snapshot();
        let out = self.out.clone();
        let err = self.err.clone();

        let mut slot = local.executor.lock().await;
        if let Some(mut old) = slot.take() {
            old.stop();
        }
        let started = tokio::task::spawn_blocking(move || Executor::start(&exec, &env, &out, &err))
            .await
            .map_err(|e| Error::Internal(format!("start task failed: {e}")))?;
        *slot = Some(started?);
        Ok(())
    }

    /// The run pipeline for a directly hosted action: strip newlines, do
    /// one interact round-trip, demand a JSON object or array back.
    ///
    /// The response bytes are returned untouched so the caller can pass
    /// them through byte-exact.
    pub async fn run_local(&self, body: &[u8]) -> Result<Vec<u8>> {
        let Mode::None(local) = &self.mode else {
            return Err(Error::Internal(
                "no directly hosted action in this mode".to_owned(),
            ));
        };

        // The child reads exactly one line; embedded newlines would desync
        // the protocol.
        let payload: Vec<u8> = body.iter().copied().filter(|&b| b != b'\n').collect();

        let mut slot = local.executor.lock().await;
        let Some(mut executor) = slot.take() else {
            return Err(Error::Internal("no action defined yet".to_owned()));
        };
        if executor.exited() {
            *slot = Some(executor);
            return Err(Error::Internal("command exited".to_owned()));
        }

        let (executor, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = executor.interact(&payload);
            (executor, outcome)
        })
        .await
        .map_err(|e| Error::Internal(format!("run task failed: {e}")))?;

        match outcome {
            Ok(response) => {
                *slot = Some(executor);
                ensure_json_result(&response)?;
                Ok(response)
            }
            Err(_) => {
                // The executor reference dies with the child; the next run
                // reports "no action defined yet".
                tracing::warn!("command exited during run");
                drop(executor);
                Err(Error::BadRequest("command exited".to_owned()))
            }
        }
    }

    /// Stops the executor (if any) and removes the active extraction
    /// directory.
    pub async fn clean_up(&self) {
        if let Mode::None(local) = &self.mode {
            if let Some(mut executor) = local.executor.lock().await.take() {
                executor.stop();
            }
        }
        let n = self.current_dir.load(Ordering::SeqCst);
        if n > 0 {
            if let Err(e) = fs::remove_dir_all(self.base_dir.join(n.to_string())) {
                tracing::debug!("error removing action directory: {e}");
            }
        }
    }

    /// Byte offsets of both log sinks, taken before a run so the growth can
    /// be captured afterwards.
    pub fn log_marks(&self) -> (u64, u64) {
        (
            self.out.len().unwrap_or(0),
            self.err.len().unwrap_or(0),
        )
    }

    /// Everything both sinks accumulated since `marks`.
    pub fn capture_logs(&self, marks: (u64, u64)) -> (String, String) {
        let read = |sink: &LogSink, from| {
            sink.capture_from(from).unwrap_or_else(|e| {
                tracing::debug!("cannot capture activation logs: {e}");
                String::new()
            })
        };
        (read(&self.out, marks.0), read(&self.err, marks.1))
    }

    /// Merges the request's env map into the child environment. String
    /// values pass through; anything else becomes compact JSON.
    fn install_env(&self, env: &serde_json::Map<String, serde_json::Value>) {
        let mut installed = self
            .env
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (key, value) in env {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            installed.insert(key.clone(), text);
        }
    }

    fn env_snapshot(&self) -> Vec<(String, String)> {
        self.env
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Accepts exactly the responses the platform does: a JSON object or array.
fn ensure_json_result(response: &[u8]) -> Result<()> {
    match serde_json::from_slice::<serde_json::Value>(response) {
        Ok(serde_json::Value::Object(_) | serde_json::Value::Array(_)) => Ok(()),
        _ => Err(Error::BadGateway(
            "The action did not return a dictionary or array.".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use actionloop_proto::InitValue;

    use super::*;

    /// A shell action usable as a "binary" payload: logs to stderr and
    /// answers on stdout.
    const GREETER: &str = "#!/bin/sh\n\
        while read line; do\n\
        echo 'Main' >&2\n\
        echo 'Hello, Mike' >&2\n\
        printf '%s\\n' '{\"greetings\":\"Hello, Mike\"}'\n\
        done\n";

    fn greeter_init() -> InitRequest {
        InitRequest {
            value: InitValue {
                code: BASE64.encode(GREETER),
                binary: true,
                ..InitValue::default()
            },
            ..InitRequest::default()
        }
    }

    fn local_proxy(dir: &Path) -> ActionProxy {
        ActionProxy::new(
            dir,
            None,
            LogSink::temp().unwrap(),
            LogSink::temp().unwrap(),
            Mode::local(),
        )
    }

    #[tokio::test]
    async fn init_then_run_greets() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());

        proxy.do_init(&greeter_init()).await.unwrap();
        assert!(proxy.initialized());
        assert_eq!(proxy.current_dir(), 1);

        let response = proxy
            .run_local(br#"{"value":{"name":"Mike"}}"#)
            .await
            .unwrap();
        assert_eq!(response, br#"{"greetings":"Hello, Mike"}"#);

        let (_, err) = proxy.capture_logs((0, 0));
        assert!(err.contains("Hello, Mike\n"));
    }

    #[tokio::test]
    async fn empty_code_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        let err = proxy.do_init(&InitRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn bad_base64_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        let request = InitRequest {
            value: InitValue {
                code: "!!! not base64 !!!".to_owned(),
                binary: true,
                ..InitValue::default()
            },
            ..InitRequest::default()
        };
        let err = proxy.do_init(&request).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn run_without_init_reports_no_action() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        let err = proxy.run_local(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::Internal(msg) if msg == "no action defined yet"));
    }

    #[tokio::test]
    async fn non_json_response_is_a_gateway_error() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        let request = InitRequest {
            value: InitValue {
                code: BASE64.encode("#!/bin/sh\nwhile read line; do echo 'not json'; done\n"),
                binary: true,
                ..InitValue::default()
            },
            ..InitRequest::default()
        };
        proxy.do_init(&request).await.unwrap();
        let err = proxy.run_local(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::BadGateway(_)));
        // The executor survives a bad response; only death clears it.
        let err = proxy.run_local(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::BadGateway(_)));
    }

    #[tokio::test]
    async fn dead_child_clears_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        let request = InitRequest {
            value: InitValue {
                code: BASE64.encode("#!/bin/sh\nread line\nexit 1\n"),
                binary: true,
                ..InitValue::default()
            },
            ..InitRequest::default()
        };
        proxy.do_init(&request).await.unwrap();

        let err = proxy.run_local(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(msg) if msg == "command exited"));
        let err = proxy.run_local(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::Internal(msg) if msg == "no action defined yet"));
    }

    #[tokio::test]
    async fn clean_up_removes_the_action_dir() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        proxy.do_init(&greeter_init()).await.unwrap();
        assert!(dir.path().join("1").exists());
        proxy.clean_up().await;
        assert!(!dir.path().join("1").exists());
    }

    #[tokio::test]
    async fn env_values_are_stringified() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = local_proxy(dir.path());
        let env: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"GREETING": "ciao", "LIMIT": 42, "NESTED": {"a": 1}}"#,
        )
        .unwrap();
        proxy.install_env(&env);
        let snapshot: HashMap<String, String> = proxy.env_snapshot().into_iter().collect();
        assert_eq!(snapshot["GREETING"], "ciao");
        assert_eq!(snapshot["LIMIT"], "42");
        assert_eq!(snapshot["NESTED"], r#"{"a":1}"#);
    }
}
