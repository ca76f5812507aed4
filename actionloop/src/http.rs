//! HTTP surface of the runtime: `/init`, `/run`, `/stop`, `/reset`.
//!
//! All endpoints are POST-only (the router answers 405 otherwise); `/stop`
//! and `/reset` additionally answer 422 outside server mode. Every failure
//! is the single `{"error": ...}` envelope, every success either
//! `{"ok":true}` or the action's own bytes.

use std::sync::Arc;

use actionloop_proto::{ErrorBody, InitRequest, RunRequest, StopRequest};
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio::net::TcpListener;

use crate::action::{ActionProxy, Mode};
use crate::error::Error;
use crate::forward;

impl Error {
    /// The HTTP status this error is answered with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::WrongMode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut body = serde_json::to_string(&ErrorBody::new(self.to_string()))
            .unwrap_or_else(|_| r#"{"error":"error encoding error response"}"#.to_owned());
        body.push('\n');
        (self.status(), [(CONTENT_TYPE, "application/json")], body).into_response()
    }
}

/// Builds the runtime's router around a shared proxy.
pub fn router(proxy: Arc<ActionProxy>) -> Router {
    Router::new()
        .route("/init", post(init_handler))
        .route("/run", post(run_handler))
        .route("/stop", post(stop_handler))
        .route("/reset", post(reset_handler))
        .with_state(proxy)
}

/// Serves the runtime until `shutdown` resolves, then finishes in-flight
/// requests and returns.
pub async fn serve(
    proxy: Arc<ActionProxy>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(proxy))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn init_handler(
    State(proxy): State<Arc<ActionProxy>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_init(&proxy, &headers, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_init(
    proxy: &Arc<ActionProxy>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, Error> {
    // Re-init is for debugging sessions only.
    if proxy.initialized() && !proxy.debug() {
        return Err(Error::Forbidden(
            "Cannot initialize the action more than once.".to_owned(),
        ));
    }

    match proxy.mode() {
        Mode::Client(state) => forward::forward_init(state, headers, body).await,
        Mode::Server(state) => {
            let request = decode_init(body)?;
            state.registry().init(proxy, &request).await?;
            Ok(ok_response())
        }
        Mode::None(_) => {
            let request = decode_init(body)?;
            proxy.do_init(&request).await?;
            Ok(ok_response())
        }
    }
}

async fn run_handler(
    State(proxy): State<Arc<ActionProxy>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_run(&proxy, &headers, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_run(
    proxy: &Arc<ActionProxy>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, Error> {
    match proxy.mode() {
        Mode::Client(state) => forward::forward_run(state, proxy, headers, body).await,
        Mode::Server(state) => {
            let request: RunRequest = serde_json::from_slice(body)
                .map_err(|e| Error::BadRequest(format!("Error decoding run body: {e}")))?;
            let envelope = state.registry().run(&request).await?;
            let payload = serde_json::to_vec(&envelope)
                .map_err(|e| Error::Internal(format!("error encoding run envelope: {e}")))?;
            Ok(json_response(payload))
        }
        Mode::None(_) => {
            let response = proxy.run_local(body).await?;
            Ok(json_response(response))
        }
    }
}

async fn stop_handler(State(proxy): State<Arc<ActionProxy>>, body: Bytes) -> Response {
    handle_stop(&proxy, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_stop(proxy: &Arc<ActionProxy>, body: &[u8]) -> Result<Response, Error> {
    let Mode::Server(state) = proxy.mode() else {
        return Err(Error::WrongMode(
            "Stop is only supported in server mode".to_owned(),
        ));
    };
    let request: StopRequest = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("Error decoding stop body: {e}")))?;
    state.registry().stop(&request).await?;
    Ok(ok_response())
}

async fn reset_handler(State(proxy): State<Arc<ActionProxy>>) -> Response {
    handle_reset(&proxy)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_reset(proxy: &Arc<ActionProxy>) -> Result<Response, Error> {
    let Mode::Server(state) = proxy.mode() else {
        return Err(Error::WrongMode(
            "Reset allowed only in server mode".to_owned(),
        ));
    };
    state.registry().reset().await;
    Ok(ok_response())
}

fn decode_init(body: &[u8]) -> Result<InitRequest, Error> {
    serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("Error unmarshaling request: {e}")))
}

fn ok_response() -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        "{\"ok\":true}\n",
    )
        .into_response()
}

/// The action's bytes, passed through without re-serialization.
fn json_response(payload: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        Body::from(payload),
    )
        .into_response()
}
