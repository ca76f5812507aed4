//! Timed deletion of drained registry entries, gated by an out-of-band
//! "setup in progress" marker.
//!
//! An external provisioning step may drop `{setup_path}/{hash}` to ask the
//! server to keep an action alive while it finishes, and
//! `{setup_path}/{hash}_done` once it has. A drained entry whose setup is
//! still running is not torn down immediately; a reaper task waits out a
//! grace period and removes the entry only if no client re-attached in the
//! meantime. The marker is deliberately not re-checked after the sleep: the
//! policy is a grace period, not "wait until setup finishes".

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::Registry;

/// Grace period used when `OW_DELETE_DURATION` is unset or unparsable.
const DEFAULT_GRACE: Duration = Duration::from_secs(10 * 60);

/// `true` while the setup marker for `hash` exists without its `_done`
/// companion.
pub(crate) fn is_setup_running(setup_path: &Path, hash: &str) -> bool {
    setup_path.join(hash).exists() && !setup_path.join(format!("{hash}_done")).exists()
}

/// Reads the reaper grace period from `OW_DELETE_DURATION`
/// (humantime grammar: `100ms`, `10m`, `1h`, ...). Defaults to 10 minutes.
pub(crate) fn delete_grace_from_env() -> Duration {
    let Ok(raw) = std::env::var("OW_DELETE_DURATION") else {
        return DEFAULT_GRACE;
    };
    match humantime::parse_duration(&raw) {
        Ok(grace) => grace,
        Err(e) => {
            tracing::warn!("invalid OW_DELETE_DURATION {raw:?}: {e}; using default");
            DEFAULT_GRACE
        }
    }
}

/// Arms the reaper for `hash`: after `grace`, the entry is removed unless
/// a client re-attached during the wait.
pub(crate) fn arm(registry: Arc<Registry>, hash: String, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        match registry.connected(&hash) {
            Some(ids) if ids.is_empty() => {
                tracing::debug!("reaper expired for {hash}; removing");
                registry.stop_and_delete(&hash).await;
            }
            Some(_) => tracing::debug!("reaper expired for {hash}; clients re-attached"),
            None => {}
        }
    });
}
