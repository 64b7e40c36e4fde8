//! Policy document schema and the pure evaluation predicates (spec §4.6).
//!
//! `PolicyDocument` is the typed structure the closed schema (spec §6)
//! validates into before anything touches it — the re-architecting note
//! "the policy schema is validated into a typed structure before use" taken
//! literally. `#[serde(deny_unknown_fields)]` enforces "unknown keys
//! rejected".

use limiq_cache::{Cache, RateLimitProbe};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub resource_scopes: Vec<String>,
    #[serde(default)]
    pub spend: Option<SpendLimits>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpendLimits {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub max_per_tx: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimits {
    #[serde(default)]
    pub max_actions_per_min: Option<i64>,
}

/// ALLOW iff `action_type` is among the capability's granted scopes, or
/// `tool` (when present) is. Scopes are compared as literal strings.
pub fn scopes_allow_action(scopes: &[String], action_type: &str, tool: Option<&str>) -> bool {
    scopes.iter().any(|s| s == action_type) || tool.is_some_and(|t| scopes.iter().any(|s| s == t))
}

/// Minimal view of the request payload the spend check needs. Arbitrary
/// other payload fields are ignored here.
pub struct SpendPayload<'a> {
    pub amount: Option<f64>,
    pub currency: Option<&'a str>,
}

/// DENY unless spend limits are satisfied. No `spend` section at all always
/// passes. A configured `max_per_tx` requires a numeric `amount` at or under
/// the limit; a configured `currency` requires an exact match.
pub fn policy_allows_payload_spend(policy: &PolicyDocument, payload: &SpendPayload) -> bool {
    let Some(spend) = &policy.spend else {
        return true;
    };

    if let Some(max_per_tx) = spend.max_per_tx {
        match payload.amount {
            Some(amount) if amount <= max_per_tx => {}
            _ => return false,
        }
    }

    if let Some(expected_currency) = &spend.currency {
        match payload.currency {
            Some(currency) if currency == expected_currency => {}
            _ => return false,
        }
    }

    true
}

/// DENY unless the rate-limit cache reports the request is within the
/// configured per-minute budget. No `rate_limits` section always passes —
/// the cache is never consulted in that case.
pub async fn policy_allows_rate(
    policy: &PolicyDocument,
    cache: &Cache,
    workspace_id: &str,
    agent_id: &str,
    action_type: &str,
    minute_bucket: i64,
    key_ttl_seconds: i64,
    fail_open: bool,
) -> bool {
    let Some(rate_limits) = &policy.rate_limits else {
        return true;
    };
    let Some(max_actions_per_min) = rate_limits.max_actions_per_min else {
        return true;
    };

    match cache
        .check_rate_limit(
            workspace_id,
            agent_id,
            action_type,
            minute_bucket,
            max_actions_per_min,
            key_ttl_seconds,
        )
        .await
    {
        RateLimitProbe::Allowed => true,
        RateLimitProbe::Denied => false,
        RateLimitProbe::Unknown => fail_open,
    }
}
