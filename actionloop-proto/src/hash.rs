//! Code-identity hashing.

use md5::{Digest, Md5};

/// Computes the identity hash of an action's `code` field: lowercase-hex
/// MD5 over the exact bytes as they appeared in the init body (the base64
/// text when the payload is binary).
///
/// MD5 is used for equivalence between trusted clients, not for security;
/// two inits with the same hash share one server-side process.
#[must_use]
pub fn action_hash(code: impl AsRef<[u8]>) -> String {
    hex::encode(Md5::digest(code.as_ref()))
}
