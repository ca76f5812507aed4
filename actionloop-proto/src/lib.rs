//! Wire vocabulary for the actionloop runtime proxy.
//!
//! The proxy speaks JSON over HTTP in every mode; this crate holds the
//! request/response body types, the code-identity hash, and the grammar of
//! the `main@url` forwarding target, so the client and server halves of the
//! runtime cannot drift apart on field spelling.

mod hash;
mod message;
mod target;

pub use hash::action_hash;
pub use message::{
    ACTIVATION_GUARD, ErrorBody, InitRequest, InitValue, OW_CODE_HASH, RunEnvelope, RunRequest,
    StopRequest,
};
pub use target::{ProxyTarget, TargetError, parse_main};
