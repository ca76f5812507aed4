//! Server-side action registry: one entry (and one child process) per code
//! hash, shared by any number of connected clients.
//!
//! Each entry owns a bounded run queue drained by a single worker task, so
//! the entry's executor never sees concurrent interacts and runs execute in
//! arrival order. Entries die when the last client detaches — immediately,
//! or after a grace period when an external setup step is still marked as
//! running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use actionloop_proto::{InitRequest, OW_CODE_HASH, RunEnvelope, RunRequest, StopRequest};
use tokio::sync::{mpsc, oneshot};

use crate::action::{ActionProxy, Mode};
use crate::error::{Error, Result};
use crate::logs::LogSink;
use crate::reaper;

/// Backpressure bound of each entry's run queue: a full queue blocks the
/// enqueueing handler until the worker catches up.
const RUN_QUEUE_CAPACITY: usize = 50;

/// State owned by a Server-mode runtime.
#[derive(Debug)]
pub struct ServerState {
    registry: Arc<Registry>,
}

impl ServerState {
    /// A registry configured from the environment
    /// (`OW_DELETE_DURATION`, markers under `/tmp`).
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Arc::new(Registry::from_env()))
    }

    /// Wraps an explicitly configured registry (tests keep their own
    /// handle for introspection).
    #[must_use]
    pub const fn with_registry(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// The shared registry.
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued run: the body handed to the child and the channel the worker
/// answers on.
struct RunJob {
    body: Vec<u8>,
    reply: oneshot::Sender<Result<RunEnvelope>>,
}

/// One multiplexed action.
#[derive(Debug)]
struct Entry {
    /// The None-mode proxy actually hosting the child.
    proxy: Arc<ActionProxy>,
    /// Client identities currently attached, in arrival order. Duplicates
    /// are allowed; stop removes the first match only.
    connected: StdMutex<Vec<String>>,
    /// Enqueue side of the run queue; the worker owns the other end.
    queue: mpsc::Sender<RunJob>,
}

impl Entry {
    fn lock_connected(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.connected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Map of code hash to live action entry.
#[derive(Debug)]
pub struct Registry {
    entries: StdMutex<HashMap<String, Arc<Entry>>>,
    /// Where external provisioning drops its `<hash>` / `<hash>_done`
    /// marker files.
    setup_path: PathBuf,
    /// Reaper grace period after the last detach while setup is running.
    grace: Duration,
}

impl Registry {
    /// A registry with the grace period taken from `OW_DELETE_DURATION`
    /// and markers under `/tmp`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            setup_path: PathBuf::from("/tmp"),
            grace: reaper::delete_grace_from_env(),
        }
    }

    /// Overrides the setup-marker directory (tests).
    #[must_use]
    pub fn with_setup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.setup_path = path.into();
        self
    }

    /// Overrides the reaper grace period (tests).
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// `true` when an entry exists for `hash`.
    pub fn contains(&self, hash: &str) -> bool {
        self.lock_entries().contains_key(hash)
    }

    /// The attached client identities of `hash`, if the entry exists.
    pub fn connected(&self, hash: &str) -> Option<Vec<String>> {
        let entry = self.lock_entries().get(hash).cloned()?;
        let ids = entry.lock_connected().clone();
        Some(ids)
    }

    /// Server-side init: attach to an existing entry for the code hash, or
    /// create a fresh one (inner proxy, child process, queue, worker).
    ///
    /// `root` supplies base dir, compiler, and debug flag for the inner
    /// proxy. The request must carry `value.env.__OW_CODE_HASH` and a
    /// `proxiedActionID`; a client that forwards through the runtime always
    /// does.
    pub async fn init(self: &Arc<Self>, root: &ActionProxy, request: &InitRequest) -> Result<()> {
        let Some(hash) = request
            .value
            .env
            .get(OW_CODE_HASH)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
        else {
            return Err(Error::BadGateway(
                "Cannot identify the action in remote runtime (missing hash).".to_owned(),
            ));
        };
        if request.proxied_action_id.is_empty() {
            return Err(Error::BadGateway("Missing action id from client.".to_owned()));
        }

        if self.attach(&hash, &request.proxied_action_id) {
            tracing::debug!(
                "action {hash} already initialized; attached id {}",
                request.proxied_action_id
            );
            return Ok(());
        }

        // First init for this hash. The inner action gets its own log files
        // so each activation's output can be shipped back to its client.
        let inner = Arc::new(
            ActionProxy::new(
                root.base_dir(),
                root.compiler().map(Path::to_path_buf),
                LogSink::temp()?,
                LogSink::temp()?,
                Mode::local(),
            )
            .with_debug(root.debug()),
        );
        inner.do_init(request).await?;

        let (queue, jobs) = mpsc::channel(RUN_QUEUE_CAPACITY);
        let entry = Arc::new(Entry {
            proxy: Arc::clone(&inner),
            connected: StdMutex::new(vec![request.proxied_action_id.clone()]),
            queue,
        });

        // The slow part ran outside the map lock; a concurrent init may
        // have registered the hash meanwhile. The winner keeps its child.
        let lost_race = {
            let mut entries = self.lock_entries();
            if let Some(existing) = entries.get(&hash) {
                existing
                    .lock_connected()
                    .push(request.proxied_action_id.clone());
                true
            } else {
                entries.insert(hash.clone(), entry);
                false
            }
        };
        if lost_race {
            inner.clean_up().await;
            return Ok(());
        }

        tracing::debug!("registered action {hash}; worker started");
        tokio::spawn(serve_queue(inner, jobs));
        Ok(())
    }

    /// Server-side run: enqueue on the entry's queue and wait for the
    /// worker's envelope.
    pub async fn run(&self, request: &RunRequest) -> Result<RunEnvelope> {
        let entry = self.find(&request.action_code_hash)?;

        // Re-encode the parsed request so the child sees one clean line,
        // whatever whitespace the client sent.
        let body = serde_json::to_vec(request)
            .map_err(|e| Error::Internal(format!("cannot encode run body: {e}")))?;

        let (reply, outcome) = oneshot::channel();
        entry
            .queue
            .send(RunJob { body, reply })
            .await
            .map_err(|_| not_found())?;
        outcome
            .await
            .map_err(|_| Error::Internal("run worker dropped the request".to_owned()))?
    }

    /// Server-side stop: detach one client identity; tear the entry down
    /// when the last one leaves, unless a setup run defers it to the
    /// reaper.
    pub async fn stop(self: &Arc<Self>, request: &StopRequest) -> Result<()> {
        let hash = &request.action_code_hash;
        let entry = self.find(hash)?;

        let now_empty = {
            let mut ids = entry.lock_connected();
            match ids.iter().position(|id| id == &request.proxied_action_id) {
                Some(pos) => {
                    ids.remove(pos);
                    ids.is_empty()
                }
                // No such identity. For a live entry that is an error, but
                // an already-drained entry (kept alive by a setup marker)
                // treats any stop as a cleanup retry.
                None if ids.is_empty() => true,
                None => {
                    return Err(Error::NotFound(
                        "Action ID not connected to the remote action.".to_owned(),
                    ));
                }
            }
        };

        if !now_empty {
            return Ok(());
        }
        if reaper::is_setup_running(&self.setup_path, hash) {
            tracing::debug!("setup running for {hash}; arming reaper");
            reaper::arm(Arc::clone(self), hash.clone(), self.grace);
            return Ok(());
        }
        self.stop_and_delete(hash).await;
        Ok(())
    }

    /// Removes every entry (POST /reset).
    pub async fn reset(&self) {
        let entries: Vec<Arc<Entry>> = {
            let mut map = self.lock_entries();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.proxy.clean_up().await;
        }
    }

    /// Drops the map key, closes the run queue, stops the executor, and
    /// removes the entry's action directory.
    pub(crate) async fn stop_and_delete(&self, hash: &str) {
        let entry = self.lock_entries().remove(hash);
        if let Some(entry) = entry {
            tracing::debug!("removing action {hash}");
            // Dropping the entry drops the queue sender; the worker drains
            // what is in flight and exits.
            entry.proxy.clean_up().await;
        }
    }

    fn attach(&self, hash: &str, id: &str) -> bool {
        let entries = self.lock_entries();
        if let Some(entry) = entries.get(hash) {
            entry.lock_connected().push(id.to_owned());
            true
        } else {
            false
        }
    }

    fn find(&self, hash: &str) -> Result<Arc<Entry>> {
        if hash.is_empty() {
            return Err(not_found());
        }
        self.lock_entries().get(hash).cloned().ok_or_else(not_found)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn not_found() -> Error {
    Error::NotFound("Action not found in remote runtime. Check logs for details.".to_owned())
}

/// The entry's worker: drains the run queue until it closes, one
/// activation at a time.
async fn serve_queue(proxy: Arc<ActionProxy>, mut jobs: mpsc::Receiver<RunJob>) {
    while let Some(job) = jobs.recv().await {
        let outcome = run_activation(&proxy, &job.body).await;
        // The caller may have disconnected; its outcome is then discarded.
        let _ = job.reply.send(outcome);
    }
    tracing::debug!("run queue closed; worker exiting");
}

/// One activation plus the log lines it produced.
async fn run_activation(proxy: &ActionProxy, body: &[u8]) -> Result<RunEnvelope> {
    let marks = proxy.log_marks();
    let raw = proxy.run_local(body).await?;
    let (out, err) = proxy.capture_logs(marks);

    let text = String::from_utf8(raw)
        .map_err(|e| Error::Internal(format!("action response is not UTF-8: {e}")))?;
    let response = serde_json::value::RawValue::from_string(text)
        .map_err(|e| Error::Internal(format!("action response is not JSON: {e}")))?;
    Ok(RunEnvelope { response, out, err })
}
