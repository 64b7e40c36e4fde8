//! The verify-action decision pipeline (spec §4.7) and the capability
//! issuer (spec §4.8). The twelve-step pipeline runs inside a single
//! transaction opened at step 1 and committed once after the terminal
//! audit event is appended — never partially.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use limiq_cache::{Cache, RevocationProbe};
use limiq_capability::{CapabilityClaims, DecodeOutcome};
use limiq_errors::{AppError, ReasonCode};
use limiq_policy::{policy_allows_payload_spend, policy_allows_rate, scopes_allow_action};
use limiq_policy::{PolicyDocument, SpendPayload};
use limiq_store::{AppendAuditEvent, AgentStatus, CapabilityStatus, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `Decision` is always wrapped in a 200-class `VerifyResponse` — it never
/// becomes an HTTP error (spec §7 tier 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub workspace_id: Uuid,
    pub agent_id: Uuid,
    pub action_type: String,
    pub target_service: String,
    pub payload: Value,
    pub signature: String,
    pub capability_token: String,
    #[serde(default)]
    pub request_context: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub decision: Decision,
    pub reason_code: Option<ReasonCode>,
    pub audit_event_id: Uuid,
}

/// Keys needed to decode/verify capability tokens; owned by the caller
/// (`main.rs`'s `AppState`) and borrowed for the lifetime of one call.
pub struct CapabilityKeys<'a> {
    pub verifying_key: &'a VerifyingKey,
    pub kid: &'a str,
    pub leeway_seconds: i64,
}

/// Rate-limiter knobs from spec §6's configuration list, threaded through
/// rather than hardcoded so `main.rs` can source them from `Settings`.
pub struct RateLimitSettings {
    pub window_seconds: i64,
    pub key_ttl_seconds: i64,
    pub fail_open: bool,
}

struct Gate {
    decision: Decision,
    reason_code: Option<ReasonCode>,
}

impl Gate {
    fn allow() -> Self {
        Gate {
            decision: Decision::Allow,
            reason_code: None,
        }
    }

    fn deny(reason: ReasonCode) -> Self {
        Gate {
            decision: Decision::Deny,
            reason_code: Some(reason),
        }
    }
}

/// Runs the twelve-step pipeline from spec §4.7 to completion and returns
/// the `VerifyResponse`. The only errors this returns are infrastructure
/// failures (spec §7 tier 3) — a failing gate is represented as `Ok` with
/// `Decision::Deny`, never as `Err`.
pub async fn verify_action(
    store: &Store,
    cache: &Cache,
    capability_keys: &CapabilityKeys<'_>,
    rate_limit_settings: &RateLimitSettings,
    req: VerifyRequest,
) -> Result<VerifyResponse, AppError> {
    let mut tx = store
        .begin()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    limiq_store::append_audit_event(
        &mut tx,
        AppendAuditEvent {
            workspace_id: req.workspace_id,
            event_type: "action.verification.requested",
            subject_type: "agent",
            subject_id: req.agent_id,
            event_data: serde_json::json!({
                "action_type": req.action_type,
                "target_service": req.target_service,
            }),
        },
    )
    .await
    .map_err(|err| AppError::Database(err.to_string()))?;

    let gate = run_gates(store, cache, capability_keys, rate_limit_settings, &req).await?;

    let terminal_event_type = match gate.decision {
        Decision::Allow => "action.verification.allowed",
        Decision::Deny => "action.verification.denied",
    };
    let terminal_event = limiq_store::append_audit_event(
        &mut tx,
        AppendAuditEvent {
            workspace_id: req.workspace_id,
            event_type: terminal_event_type,
            subject_type: "agent",
            subject_id: req.agent_id,
            event_data: serde_json::json!({
                "decision": gate.decision,
                "reason_code": gate.reason_code.map(ReasonCode::as_str),
                "action_type": req.action_type,
            }),
        },
    )
    .await
    .map_err(|err| AppError::Database(err.to_string()))?;

    tx.commit()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    Ok(VerifyResponse {
        decision: gate.decision,
        reason_code: gate.reason_code,
        audit_event_id: terminal_event.id,
    })
}

/// Steps 2-12 of the pipeline. Returns `Ok(Gate)` for every decision
/// (ALLOW or DENY); `Err` only for an infrastructure failure that prevents
/// evaluating the remaining gates at all (the durable store being
/// unreachable — the cache degrading is handled internally per §4.4/§9).
async fn run_gates(
    store: &Store,
    cache: &Cache,
    capability_keys: &CapabilityKeys<'_>,
    rate_limit_settings: &RateLimitSettings,
    req: &VerifyRequest,
) -> Result<Gate, AppError> {
    // Step 2: agent lookup and status.
    let agent = store
        .get_agent(req.workspace_id, req.agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let Some(agent) = agent else {
        return Ok(Gate::deny(ReasonCode::AgentNotFound));
    };
    if agent.status != AgentStatus::Active {
        return Ok(Gate::deny(ReasonCode::AgentRevoked));
    }

    // Step 3: decode capability token.
    let claims = match limiq_capability::decode(
        &req.capability_token,
        capability_keys.verifying_key,
        capability_keys.kid,
        capability_keys.leeway_seconds,
    ) {
        DecodeOutcome::Ok(claims) => claims,
        DecodeOutcome::Expired => return Ok(Gate::deny(ReasonCode::CapabilityExpired)),
        DecodeOutcome::Invalid => return Ok(Gate::deny(ReasonCode::CapabilityInvalid)),
    };

    // Step 4: claims must match the request's agent/workspace.
    if claims.sub != req.agent_id.to_string() || claims.workspace_id != req.workspace_id.to_string()
    {
        return Ok(Gate::deny(ReasonCode::WorkspaceMismatch));
    }

    // Step 5: revocation check (cache then store).
    if is_revoked(store, cache, req.workspace_id, &claims.jti).await? {
        return Ok(Gate::deny(ReasonCode::CapabilityRevoked));
    }

    // Step 6: capability row must exist and be active.
    let capability = store
        .get_capability_by_jti(req.workspace_id, &claims.jti)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let Some(capability) = capability else {
        return Ok(Gate::deny(ReasonCode::CapabilityRevoked));
    };
    if capability.status != CapabilityStatus::Active {
        return Ok(Gate::deny(ReasonCode::CapabilityRevoked));
    }

    // Step 7: scope check.
    let tool = req.payload.get("tool").and_then(Value::as_str);
    if !scopes_allow_action(&claims.scopes, &req.action_type, tool) {
        return Ok(Gate::deny(ReasonCode::CapabilityScopeMismatch));
    }

    // Step 8: signed envelope verification.
    if !verify_signed_envelope(&agent, req, &claims) {
        return Ok(Gate::deny(ReasonCode::SignatureInvalid));
    }

    // Step 9: active binding + policy lookup.
    let policy_row = store
        .get_active_binding_with_policy(req.workspace_id, req.agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let Some(policy_row) = policy_row else {
        return Ok(Gate::deny(ReasonCode::PolicyNotBound));
    };
    let policy: PolicyDocument = match serde_json::from_value(policy_row.policy_json.clone()) {
        Ok(policy) => policy,
        Err(err) => {
            tracing::error!(error = %err, "bound policy document failed schema validation at read time");
            return Ok(Gate::deny(ReasonCode::PolicyNotBound));
        }
    };

    // Step 10: spend limit.
    let spend_payload = SpendPayload {
        amount: req.payload.get("amount").and_then(Value::as_f64),
        currency: req.payload.get("currency").and_then(Value::as_str),
    };
    if !policy_allows_payload_spend(&policy, &spend_payload) {
        return Ok(Gate::deny(ReasonCode::SpendLimitExceeded));
    }

    // Step 11: rate limit.
    let minute_bucket = Utc::now().timestamp() / rate_limit_settings.window_seconds;
    let allowed = policy_allows_rate(
        &policy,
        cache,
        &req.workspace_id.to_string(),
        &req.agent_id.to_string(),
        &req.action_type,
        minute_bucket,
        rate_limit_settings.key_ttl_seconds,
        rate_limit_settings.fail_open,
    )
    .await;
    if !allowed {
        return Ok(Gate::deny(ReasonCode::RateLimitExceeded));
    }

    // Step 12: ALLOW.
    Ok(Gate::allow())
}

async fn is_revoked(
    store: &Store,
    cache: &Cache,
    workspace_id: Uuid,
    jti: &str,
) -> Result<bool, AppError> {
    match cache.probe_revoked(jti).await {
        RevocationProbe::Revoked => Ok(true),
        RevocationProbe::NotRevoked => Ok(false),
        RevocationProbe::Unknown => {
            let revocation = store
                .find_revocation(workspace_id, jti)
                .await
                .map_err(|err| AppError::Database(err.to_string()))?;
            Ok(revocation.is_some())
        }
    }
}

fn verify_signed_envelope(
    agent: &limiq_store::Agent,
    req: &VerifyRequest,
    claims: &CapabilityClaims,
) -> bool {
    let envelope = limiq_canonical::signed_envelope(
        &req.agent_id.to_string(),
        &req.workspace_id.to_string(),
        &req.action_type,
        &req.target_service,
        &req.payload,
        &claims.jti,
    );
    let digest = limiq_canonical::canonical_digest(&envelope);

    limiq_crypto::verify_ed25519_b64(&agent.public_key, &digest, &req.signature)
}

// --- Capability issuance (spec §4.8) ---

#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityRequest {
    pub workspace_id: Uuid,
    pub agent_id: Uuid,
    pub action: String,
    pub target_service: String,
    pub requested_scopes: Vec<String>,
    #[serde(default)]
    pub requested_limits: BTreeMap<String, Value>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityResponse {
    pub token: String,
    pub jti: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("agent not found")]
    AgentNotFound,
    #[error("agent is revoked")]
    AgentRevoked,
    #[error(transparent)]
    App(#[from] AppError),
}

pub struct IssuerLimits {
    pub default_ttl_minutes: i64,
    pub min_ttl_minutes: i64,
    pub max_ttl_minutes: i64,
}

/// Clamps `requested.ttl_minutes` into `[limits.min_ttl_minutes,
/// limits.max_ttl_minutes]` rather than rejecting an out-of-range value
/// (spec §4.8, resolved Open Question — see DESIGN.md).
fn clamp_ttl(requested: Option<i64>, limits: &IssuerLimits) -> i64 {
    requested
        .unwrap_or(limits.default_ttl_minutes)
        .clamp(limits.min_ttl_minutes, limits.max_ttl_minutes)
}

pub async fn issue_capability(
    store: &Store,
    signing_key: &SigningKey,
    kid: &str,
    limits: &IssuerLimits,
    req: CapabilityRequest,
) -> Result<CapabilityResponse, IssueError> {
    let agent = store
        .get_agent(req.workspace_id, req.agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let Some(agent) = agent else {
        return Err(IssueError::AgentNotFound);
    };
    if agent.status != AgentStatus::Active {
        return Err(IssueError::AgentRevoked);
    }

    let binding_policy = store
        .get_active_binding_with_policy(req.workspace_id, req.agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    let ttl_minutes = clamp_ttl(req.ttl_minutes, limits);
    let jti = Uuid::new_v4().to_string();
    let issued_at = Utc::now();
    let expires_at = issued_at + Duration::minutes(ttl_minutes);

    let scopes_json = serde_json::json!({ "items": req.requested_scopes });
    let limits_json = serde_json::to_value(&req.requested_limits).unwrap_or_else(|_| serde_json::json!({}));

    let mut tx = store
        .begin()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    store
        .create_capability(
            &mut tx,
            req.workspace_id,
            req.agent_id,
            &jti,
            scopes_json,
            limits_json.clone(),
            issued_at,
            ttl_minutes,
        )
        .await
        .map_err(|err| AppError::Conflict(err.to_string()))?;

    let claims = CapabilityClaims {
        sub: req.agent_id.to_string(),
        workspace_id: req.workspace_id.to_string(),
        scopes: req.requested_scopes.clone(),
        limits: limits_json
            .as_object()
            .cloned()
            .unwrap_or_default(),
        policy_id: binding_policy.as_ref().map(|p| p.id.to_string()),
        policy_version: binding_policy.as_ref().map(|p| p.version),
        iat: issued_at.timestamp(),
        exp: expires_at.timestamp(),
        jti: jti.clone(),
    };
    let token = limiq_capability::encode(&claims, signing_key, kid);

    limiq_store::append_audit_event(
        &mut tx,
        AppendAuditEvent {
            workspace_id: req.workspace_id,
            event_type: "capability.issued",
            subject_type: "agent",
            subject_id: req.agent_id,
            event_data: serde_json::json!({
                "jti": jti,
                "action": req.action,
                "target_service": req.target_service,
                "ttl_minutes": ttl_minutes,
            }),
        },
    )
    .await
    .map_err(|err| AppError::Database(err.to_string()))?;

    tx.commit()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    Ok(CapabilityResponse {
        token,
        jti,
        issued_at,
        expires_at,
    })
}
