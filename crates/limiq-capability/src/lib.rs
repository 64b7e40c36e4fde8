//! Capability token codec: compact JWS, algorithm EdDSA, signed by the
//! service-wide signing key (spec §4.3).
//!
//! The teacher encodes its capability as CBOR and signs the CBOR bytes
//! directly with `ed25519_dalek` — no JWT library in the dependency graph.
//! This module keeps that exact idiom (canonical bytes in, `Signer::sign`,
//! base64 out) but produces the three-part compact JWS the wire format
//! calls for, hand-built rather than pulled from a JWT crate: no crate in
//! this corpus carries EdDSA-over-Ed25519 JWS cleanly, and the teacher's own
//! pattern already is "build the exact bytes, sign them, base64 them".

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Claims carried by a capability token (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityClaims {
    pub sub: String,
    pub workspace_id: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub limits: Map<String, Value>,
    pub policy_id: Option<String>,
    pub policy_version: Option<i64>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header<'a> {
    alg: &'static str,
    kid: &'a str,
    typ: &'static str,
}

/// Outcome of decoding a capability token. Two failure classes matter to
/// the caller, per spec §4.3/§9: `Expired` is distinguished from every
/// other failure (`Invalid`), including unexpected/unrecognized errors,
/// which are logged and folded into `Invalid` rather than propagated.
#[derive(Debug)]
pub enum DecodeOutcome {
    Ok(CapabilityClaims),
    Expired,
    Invalid,
}

/// Encode `claims` as a compact EdDSA JWS: `base64url(header).base64url(payload).base64url(signature)`.
pub fn encode(claims: &CapabilityClaims, signing_key: &SigningKey, kid: &str) -> String {
    let header = Header {
        alg: "EdDSA",
        kid,
        typ: "JWT",
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("header serializes"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));

    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    format!("{signing_input}.{signature_b64}")
}

/// Decode and verify a capability token against `verifying_key`/`expected_kid`.
///
/// Any structural problem (wrong number of parts, bad base64, bad JSON,
/// `kid`/`alg` mismatch, bad signature) maps to `Invalid`. A token that
/// structurally checks out but whose `exp` (plus `leeway_seconds`) has
/// passed maps to `Expired`. Clock skew is applied symmetrically, matching
/// the configurable leeway in spec §4.3.
pub fn decode(
    token: &str,
    verifying_key: &VerifyingKey,
    expected_kid: &str,
    leeway_seconds: i64,
) -> DecodeOutcome {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = match parts.as_slice() {
        [a, b, c] => [*a, *b, *c],
        _ => {
            tracing::warn!("capability token does not have three JWS segments");
            return DecodeOutcome::Invalid;
        }
    };

    let Ok(header_bytes) = URL_SAFE_NO_PAD.decode(header_b64) else {
        tracing::warn!("capability token header is not valid base64url");
        return DecodeOutcome::Invalid;
    };
    let header: Header = match serde_json::from_slice(&header_bytes) {
        Ok(h) => h,
        Err(err) => {
            tracing::warn!(error = %err, "capability token header is not valid JSON");
            return DecodeOutcome::Invalid;
        }
    };
    if header.alg != "EdDSA" || header.kid != expected_kid {
        tracing::warn!(alg = header.alg, kid = header.kid, "capability token header mismatch");
        return DecodeOutcome::Invalid;
    }

    let Ok(signature_bytes) = URL_SAFE_NO_PAD.decode(signature_b64) else {
        tracing::warn!("capability token signature is not valid base64url");
        return DecodeOutcome::Invalid;
    };
    let Ok(signature_bytes): Result<[u8; 64], _> = signature_bytes.try_into() else {
        tracing::warn!("capability token signature has the wrong length");
        return DecodeOutcome::Invalid;
    };
    let signature = Signature::from_bytes(&signature_bytes);

    let signing_input = format!("{header_b64}.{payload_b64}");
    if verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .is_err()
    {
        return DecodeOutcome::Invalid;
    }

    let Ok(payload_bytes) = URL_SAFE_NO_PAD.decode(payload_b64) else {
        tracing::warn!("capability token payload is not valid base64url");
        return DecodeOutcome::Invalid;
    };
    let claims: CapabilityClaims = match serde_json::from_slice(&payload_bytes) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "unexpected error decoding capability claims");
            return DecodeOutcome::Invalid;
        }
    };

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(err) => {
            tracing::error!(error = %err, "system clock before unix epoch");
            return DecodeOutcome::Invalid;
        }
    };
    if now > claims.exp + leeway_seconds {
        return DecodeOutcome::Expired;
    }

    DecodeOutcome::Ok(claims)
}
