//! Ed25519 signature verification, fail-closed.
//!
//! Mirrors the teacher's own use of `ed25519_dalek` directly against raw
//! key/signature bytes (no detour through a generic crypto-provider trait):
//! given a 32-byte public key, a message, and a 64-byte signature, answer
//! true/false. Malformed base64, wrong-length inputs, and any
//! library-level verification failure are all folded into `false` and
//! logged — never propagated as an `Err` to the caller, since the verify
//! pipeline treats "signature did not check out" as a decision, not an
//! infrastructure fault.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Verify a detached Ed25519 signature over `message`.
///
/// Returns `false` (never an error) on malformed input of any kind: wrong
/// key/signature length, a signature that doesn't verify, or anything else
/// the underlying crate rejects.
pub fn verify_ed25519(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes): Result<[u8; 32], _> = public_key.try_into() else {
        tracing::warn!(len = public_key.len(), "ed25519 public key has wrong length");
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        tracing::warn!("ed25519 public key is not a valid curve point");
        return false;
    };
    let Ok(sig_bytes): Result<[u8; 64], _> = signature.try_into() else {
        tracing::warn!(len = signature.len(), "ed25519 signature has wrong length");
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);

    match verifying_key.verify(message, &signature) {
        Ok(()) => true,
        Err(_) => false,
    }
}

/// Same as [`verify_ed25519`] but with base64-encoded key and signature —
/// the shape the wire and the stored `Agent.public_key` column actually use.
pub fn verify_ed25519_b64(public_key_b64: &str, message: &[u8], signature_b64: &str) -> bool {
    let Ok(public_key) = general_purpose::STANDARD.decode(public_key_b64) else {
        tracing::warn!("ed25519 public key is not valid base64");
        return false;
    };
    let Ok(signature) = general_purpose::STANDARD.decode(signature_b64) else {
        tracing::warn!("ed25519 signature is not valid base64");
        return false;
    };
    verify_ed25519(&public_key, message, &signature)
}

/// Sign `digest` with `signing_key`. Used by the capability issuer (to sign
/// tokens) and by tests/SDK-parity helpers that need to produce a valid
/// agent signature without going through HTTP.
pub fn sign_digest(signing_key: &SigningKey, digest: &[u8]) -> Signature {
    signing_key.sign(digest)
}
