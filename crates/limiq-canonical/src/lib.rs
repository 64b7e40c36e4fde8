//! Deterministic encoding of a mapping from string keys to JSON-compatible
//! values into bytes. Shared by the agent-side signer and the verifier: both
//! must derive the same SHA-256 digest from the same logical payload.
//!
//! `serde_json::Value` is used as the tagged value type (string / number /
//! bool / array / object) called for by the re-architecting notes. With the
//! crate's default features (no `preserve_order`), object maps are backed by
//! a `BTreeMap`, so keys already come out lexicographically sorted by UTF-8
//! byte value; the compact `to_vec` formatter never inserts insignificant
//! whitespace and never escapes codepoints above U+007F. Those two defaults
//! are exactly the encoding this module is asked to guarantee, so the job
//! here is mostly to pin that guarantee down with a name and a test-vector
//! suite rather than to hand-roll a new serializer.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encode `value` into canonical bytes: sorted keys, no insignificant
/// whitespace, non-ASCII left as-is, numbers in their shortest exact form.
///
/// `value` must be a JSON object at the top level for the result to be
/// meaningful as a signed envelope or audit-event body, but any JSON value
/// canonicalizes deterministically.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    // `to_vec` never fails for a `Value` (no non-finite floats can appear in
    // one, and it has no non-string map keys to reject).
    serde_json::to_vec(value).expect("Value serialization is infallible")
}

/// SHA-256 over the canonical encoding of `value`.
pub fn canonical_digest(value: &Value) -> [u8; 32] {
    sha256(&canonical_json_bytes(value))
}

/// SHA-256 over arbitrary bytes, exposed for callers that already have a
/// canonical byte string (e.g. audit event hash-chaining).
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Build the six-field signed envelope from spec §4.1/§6 with exactly the
/// required key set, no more, no less.
pub fn signed_envelope(
    agent_id: &str,
    workspace_id: &str,
    action_type: &str,
    target_service: &str,
    payload: &Value,
    capability_jti: &str,
) -> Value {
    serde_json::json!({
        "agent_id": agent_id,
        "workspace_id": workspace_id,
        "action_type": action_type,
        "target_service": target_service,
        "payload": payload,
        "capability_jti": capability_jti,
    })
}
