//! HTTP body types exchanged between the invoker, client proxies, and
//! server proxies.
//!
//! Field names are wire-exact: OpenWhisk invokers and the Go runtimes spell
//! them `proxiedActionID`, `actionCodeHash`, and `__OW_CODE_HASH`, and every
//! serde rename below exists to preserve that spelling.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Environment key carrying the code-identity hash on a forwarded init.
pub const OW_CODE_HASH: &str = "__OW_CODE_HASH";

/// Sentinel line appended to both log streams after every activation, so
/// log consumers can split the streams per invocation.
pub const ACTIVATION_GUARD: &str = "XXX_THE_END_OF_A_WHISK_ACTIVATION_XXX";

/// The `value` object of an init request: the action's code and metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitValue {
    /// Action code: either UTF-8 source or a base64-encoded payload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    /// `true` when `code` is base64 of a binary payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary: bool,
    /// Entry-point name; empty means the literal `main`. In client mode
    /// this field carries the `[func]@url` forwarding target instead.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub main: String,
    /// Environment installed into the action process.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub env: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitRequest {
    /// Client-generated identity echoed on later run/stop requests.
    #[serde(
        rename = "proxiedActionID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub proxied_action_id: String,
    /// The action payload.
    #[serde(default)]
    pub value: InitValue,
}

/// Body of `POST /run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Identity of the calling client proxy, if any.
    #[serde(
        rename = "proxiedActionID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub proxied_action_id: String,
    /// Registry key of the multiplexed action on the server.
    #[serde(
        rename = "actionCodeHash",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub action_code_hash: String,
    /// Parameters handed to the action.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub value: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /stop`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    /// Identity of the disconnecting client proxy.
    #[serde(
        rename = "proxiedActionID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub proxied_action_id: String,
    /// Registry key of the action the client was attached to.
    #[serde(
        rename = "actionCodeHash",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub action_code_hash: String,
}

/// Server reply to a proxied run: the action's response plus the log lines
/// the activation produced, so the client can replay them locally.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunEnvelope {
    /// The action's JSON result, byte-exact as the child emitted it.
    pub response: Box<RawValue>,
    /// Stdout captured for this activation (sentinel included).
    #[serde(default)]
    pub out: String,
    /// Stderr captured for this activation (sentinel included).
    #[serde(default)]
    pub err: String,
}

/// The single error envelope every failing endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable cause.
    pub error: String,
}

impl ErrorBody {
    /// Creates an error envelope with the given cause.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_wire_keys() {
        let body = r#"{
            "value": {"code": "abc", "binary": true, "main": "hello", "env": {"K": "v"}},
            "proxiedActionID": "id-1"
        }"#;
        let req: InitRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.proxied_action_id, "id-1");
        assert_eq!(req.value.code, "abc");
        assert!(req.value.binary);
        assert_eq!(req.value.main, "hello");
        assert_eq!(req.value.env["K"], "v");

        let out = serde_json::to_string(&req).unwrap();
        assert!(out.contains("\"proxiedActionID\":\"id-1\""));
        assert!(!out.contains("proxied_action_id"));
    }

    #[test]
    fn init_request_all_fields_optional() {
        let req: InitRequest = serde_json::from_str("{}").unwrap();
        assert!(req.proxied_action_id.is_empty());
        assert!(req.value.code.is_empty());
        assert!(!req.value.binary);
    }

    #[test]
    fn run_request_wire_keys() {
        let body = r#"{"value": {"name": "Mike"}, "actionCodeHash": "h", "proxiedActionID": "p"}"#;
        let req: RunRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.action_code_hash, "h");
        assert_eq!(req.proxied_action_id, "p");
        assert_eq!(req.value["name"], "Mike");

        let out = serde_json::to_string(&req).unwrap();
        assert!(out.contains("\"actionCodeHash\":\"h\""));
        assert!(out.contains("\"proxiedActionID\":\"p\""));
    }

    #[test]
    fn empty_fields_stay_off_the_wire() {
        let req = RunRequest::default();
        assert_eq!(serde_json::to_string(&req).unwrap(), "{}");
        let stop = StopRequest::default();
        assert_eq!(serde_json::to_string(&stop).unwrap(), "{}");
    }

    #[test]
    fn envelope_preserves_response_bytes() {
        // Key order and spacing inside `response` must survive the trip.
        let raw = r#"{"response":{"b":1,"a":2},"out":"Main\n","err":""}"#;
        let env: RunEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.response.get(), r#"{"b":1,"a":2}"#);
        assert_eq!(env.out, "Main\n");

        let back = serde_json::to_string(&env).unwrap();
        assert!(back.contains(r#"{"b":1,"a":2}"#));
    }

    #[test]
    fn code_hash_env_key_spelling() {
        assert_eq!(OW_CODE_HASH, "__OW_CODE_HASH");
    }
}
