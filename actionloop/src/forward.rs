//! Client-mode forwarding: rewrite init/run bodies and reverse-proxy them
//! to the server runtime, replaying remote activation logs locally.
//!
//! To its own caller a client runtime is indistinguishable from a local
//! one: the caller sees the action's response bytes, and the action's
//! stdout/stderr show up in the client's log sinks.

use std::sync::Mutex as StdMutex;

use actionloop_proto::{InitRequest, ProxyTarget, RunEnvelope, RunRequest, action_hash, parse_main};
use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use url::Url;

use crate::action::ActionProxy;
use crate::error::{Error, Result};

/// State owned by a Client-mode runtime.
#[derive(Debug)]
pub struct ClientState {
    /// Forwarding identity, set by the first init.
    data: StdMutex<Option<ClientData>>,
    http: reqwest::Client,
}

/// Everything a client remembers from its init: where to forward, which
/// entry point to restore, and how to identify itself and its code.
#[derive(Debug, Clone)]
pub(crate) struct ClientData {
    /// Entry point forwarded in place of the `func@url` target.
    pub main_func: String,
    /// Base URL of the server runtime.
    pub target: Url,
    /// This client's identity, generated at init and echoed on run/stop.
    pub action_id: String,
    /// Identity hash of the forwarded code.
    pub code_hash: String,
}

impl ClientState {
    /// A client with no forwarding identity yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: StdMutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub(crate) fn data(&self) -> Option<ClientData> {
        self.lock().clone()
    }

    pub(crate) fn install(&self, data: ClientData) {
        *self.lock() = Some(data);
    }

    pub(crate) const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ClientData>> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards an init request: parse the `[func]@url` target out of `main`,
/// stamp the body with the code hash and a fresh client identity, and
/// reverse-proxy it.
pub(crate) async fn forward_init(
    state: &ClientState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response<Body>> {
    let mut request: InitRequest = serde_json::from_slice(body).map_err(|e| {
        Error::BadRequest(format!(
            "Error decoding init body while forwarding request: {e}"
        ))
    })?;

    let target = parse_main(&request.value.main).map_err(|e| Error::BadRequest(e.to_string()))?;
    let data = client_data(&target, &request.value.code);
    rewrite_init(&mut request, &data);
    tracing::debug!(
        "forwarding init to {} as {}",
        data.target,
        data.action_id
    );

    let outbound = serde_json::to_vec(&request)
        .map_err(|e| Error::BadRequest(format!("Error encoding updated init body: {e}")))?;

    state.install(data.clone());

    let response = send(state, &data.target, "/init", headers, outbound).await?;
    into_http_response(response).await
}

/// Forwards a run request: stamp the body with this client's identity and
/// code hash; on success unwrap the `{response, out, err}` envelope,
/// appending the remote logs locally.
pub(crate) async fn forward_run(
    state: &ClientState,
    proxy: &ActionProxy,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response<Body>> {
    let Some(data) = state.data() else {
        return Err(Error::Internal("Send init first".to_owned()));
    };

    let mut request: RunRequest = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("Error decoding run body: {e}")))?;
    request.proxied_action_id.clone_from(&data.action_id);
    request.action_code_hash.clone_from(&data.code_hash);

    let outbound = serde_json::to_vec(&request)
        .map_err(|e| Error::BadRequest(format!("Error encoding updated run body: {e}")))?;

    let response = send(state, &data.target, "/run", headers, outbound).await?;
    if response.status() != reqwest::StatusCode::OK {
        return into_http_response(response).await;
    }

    let payload = response
        .bytes()
        .await
        .map_err(|e| Error::BadGateway(format!("Error reading remote run response: {e}")))?;
    let envelope: RunEnvelope = serde_json::from_slice(&payload)
        .map_err(|e| Error::BadGateway(format!("Error decoding remote run response: {e}")))?;

    // Replay the remote activation's output into the local logs, sentinels
    // and all, as if the action had run here.
    if let Err(e) = proxy.out().write_record(envelope.out.as_bytes()) {
        tracing::debug!("cannot replay remote stdout: {e}");
    }
    if let Err(e) = proxy.err().write_record(envelope.err.as_bytes()) {
        tracing::debug!("cannot replay remote stderr: {e}");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(envelope.response.get().to_owned()))
        .map_err(|e| Error::Internal(e.to_string()))
}

fn client_data(target: &ProxyTarget, code: &str) -> ClientData {
    ClientData {
        main_func: target.main_func.clone(),
        target: target.url.clone(),
        action_id: uuid::Uuid::new_v4().to_string(),
        code_hash: action_hash(code),
    }
}

/// Applies the client-side init rewrite: restore the real entry point,
/// stamp the code hash into the env, claim the client identity.
fn rewrite_init(request: &mut InitRequest, data: &ClientData) {
    request.value.main.clone_from(&data.main_func);
    request.value.env.insert(
        actionloop_proto::OW_CODE_HASH.to_owned(),
        data.code_hash.clone().into(),
    );
    request.proxied_action_id.clone_from(&data.action_id);
}

/// POSTs `body` to `{target}{path}`, forwarding the caller's headers.
/// Content-Length is recomputed from the rewritten body.
async fn send(
    state: &ClientState,
    target: &Url,
    path: &str,
    headers: &HeaderMap,
    body: Vec<u8>,
) -> Result<reqwest::Response> {
    let mut url = target.clone();
    url.set_path(path);

    let mut outbound = state.http.post(url).body(body);
    for (name, value) in headers {
        if skip_header(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }
    outbound = outbound.header("Content-Type", "application/json");

    outbound
        .send()
        .await
        .map_err(|e| Error::BadGateway(format!("Error proxying request: {e}")))
}

/// Headers a reverse proxy must not blindly copy: addressing and framing
/// are recomputed per hop.
fn skip_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Converts an upstream reqwest response into the HTTP response handed to
/// our own caller, preserving status and end-to-end headers.
async fn into_http_response(response: reqwest::Response) -> Result<Response<Body>> {
    let status = response.status().as_u16();
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if skip_header(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let payload = response
        .bytes()
        .await
        .map_err(|e| Error::BadGateway(format!("Error reading upstream response: {e}")))?;
    builder
        .body(Body::from(payload))
        .map_err(|e| Error::Internal(e.to_string()))
}
