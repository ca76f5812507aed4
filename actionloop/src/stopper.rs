//! Signal-driven remote cleanup.
//!
//! A client runtime that dies without saying goodbye would leak its
//! identity in the server's registry until the reaper catches up. The
//! shutdown future below waits for the usual termination signals, sends a
//! best-effort `POST /stop` for this client's action, and then resolves —
//! letting the HTTP server finish in-flight requests and exit cleanly
//! instead of being torn down mid-write.

use std::sync::Arc;

use actionloop_proto::StopRequest;

use crate::action::{ActionProxy, Mode};
use crate::error::{Error, Result};

/// Resolves once a termination signal (SIGINT, SIGTERM, SIGABRT, SIGQUIT,
/// SIGHUP) has been caught and, in client mode, the remote stop request
/// has been attempted. Intended as the HTTP server's graceful-shutdown
/// trigger.
pub async fn shutdown_signal(proxy: Arc<ActionProxy>) {
    use tokio::signal::unix::SignalKind;

    tokio::select! {
        () = wait_for(SignalKind::interrupt()) => {}
        () = wait_for(SignalKind::terminate()) => {}
        () = wait_for(SignalKind::quit()) => {}
        () = wait_for(SignalKind::hangup()) => {}
        () = wait_for(SignalKind::from_raw(libc::SIGABRT)) => {}
    }
    tracing::info!("caught exit signal");

    if matches!(proxy.mode(), Mode::Client(_)) {
        if let Err(e) = send_stop_request(&proxy).await {
            tracing::warn!("remote action cleanup failed: {e}");
        } else {
            tracing::debug!("finished remote action cleanup");
        }
    }
}

async fn wait_for(kind: tokio::signal::unix::SignalKind) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            // Rare (fd exhaustion); without the handler this signal simply
            // never triggers a graceful stop.
            tracing::warn!("cannot install signal handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Sends this client's identity to the server's `/stop` endpoint and reads
/// the reply. Fails when the runtime is not an initialized client.
pub async fn send_stop_request(proxy: &ActionProxy) -> Result<()> {
    let Mode::Client(state) = proxy.mode() else {
        return Err(Error::Internal("runtime not set as client".to_owned()));
    };
    let Some(data) = state.data() else {
        return Err(Error::Internal("runtime not set as client".to_owned()));
    };

    let stop = StopRequest {
        action_code_hash: data.code_hash,
        proxied_action_id: data.action_id,
    };
    let body = serde_json::to_vec(&stop)
        .map_err(|e| Error::Internal(format!("error encoding stop request body: {e}")))?;

    let mut url = data.target;
    url.set_path("/stop");
    tracing::debug!("sending stop request to {url}");

    let response = state
        .http()
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| Error::BadGateway(format!("failed to send stop request: {e}")))?;

    // Best-effort read; the reply is only interesting for the logs.
    let reply = response.text().await.unwrap_or_default();
    tracing::debug!("stop request response: {reply}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::post;

    use super::*;
    use crate::forward::{ClientData, ClientState};
    use crate::logs::LogSink;

    fn client_proxy(dir: &std::path::Path, state: ClientState) -> ActionProxy {
        ActionProxy::new(
            dir,
            None,
            LogSink::temp().unwrap(),
            LogSink::temp().unwrap(),
            Mode::Client(state),
        )
    }

    #[tokio::test]
    async fn wrong_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = ActionProxy::new(
            dir.path(),
            None,
            LogSink::temp().unwrap(),
            LogSink::temp().unwrap(),
            Mode::local(),
        );
        let err = send_stop_request(&proxy).await.unwrap_err();
        assert!(err.to_string().contains("runtime not set as client"));
    }

    #[tokio::test]
    async fn uninitialized_client_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = client_proxy(dir.path(), ClientState::new());
        assert!(send_stop_request(&proxy).await.is_err());
    }

    #[tokio::test]
    async fn stop_request_carries_the_client_identity() {
        // A stub server that records the stop body it receives.
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<StopRequest>(1);
        let app = Router::new().route(
            "/stop",
            post(move |body: axum::body::Bytes| {
                let seen_tx = seen_tx.clone();
                async move {
                    let stop: StopRequest = serde_json::from_slice(&body).unwrap();
                    seen_tx.send(stop).await.unwrap();
                    "{\"ok\":true}\n"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let state = ClientState::new();
        state.install(ClientData {
            main_func: String::new(),
            target: url::Url::parse(&format!("http://{addr}")).unwrap(),
            action_id: "test-action-id".to_owned(),
            code_hash: "cafebabe".to_owned(),
        });
        let dir = tempfile::tempdir().unwrap();
        let proxy = client_proxy(dir.path(), state);

        send_stop_request(&proxy).await.unwrap();
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen.proxied_action_id, "test-action-id");
        assert_eq!(seen.action_code_hash, "cafebabe");
    }
}
