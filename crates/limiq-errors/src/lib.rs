//! The closed reason-code taxonomy (spec §6) and the shared application
//! error type.
//!
//! Two different things share this crate on purpose: `ReasonCode` never
//! travels as an HTTP error — it is always embedded in a `200 OK`
//! `VerifyResponse` — while `AppError` is exactly the transport-level/
//! infrastructure-level error the teacher's own `AppError` models (a
//! `thiserror` enum with a `status()`-style method and a JSON envelope).
//! Keeping both here means `limiq-engine` and `main.rs` agree on both
//! vocabularies without a dependency cycle.

use serde::Serialize;
use thiserror::Error;

/// The closed set of DENY reason codes from spec §6. Never add a variant
/// here without also adding it to the specification's closed set — callers
/// match exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    AgentNotFound,
    AgentRevoked,
    CapabilityExpired,
    CapabilityInvalid,
    CapabilityRevoked,
    CapabilityScopeMismatch,
    SignatureInvalid,
    WorkspaceMismatch,
    PolicyNotBound,
    SpendLimitExceeded,
    RateLimitExceeded,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::AgentNotFound => "AGENT_NOT_FOUND",
            ReasonCode::AgentRevoked => "AGENT_REVOKED",
            ReasonCode::CapabilityExpired => "CAPABILITY_EXPIRED",
            ReasonCode::CapabilityInvalid => "CAPABILITY_INVALID",
            ReasonCode::CapabilityRevoked => "CAPABILITY_REVOKED",
            ReasonCode::CapabilityScopeMismatch => "CAPABILITY_SCOPE_MISMATCH",
            ReasonCode::SignatureInvalid => "SIGNATURE_INVALID",
            ReasonCode::WorkspaceMismatch => "WORKSPACE_MISMATCH",
            ReasonCode::PolicyNotBound => "POLICY_NOT_BOUND",
            ReasonCode::SpendLimitExceeded => "SPEND_LIMIT_EXCEEDED",
            ReasonCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport/infrastructure-level errors. Decision errors (spec §7 tier 1)
/// never become an `AppError` — they are a `DENY` with a `ReasonCode`
/// returned straight from `limiq-engine`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("policy schema invalid: {0}")]
    PolicySchemaInvalid(String),
    #[error("workspace mismatch")]
    WorkspaceMismatch,
    #[error("database error: {0}")]
    Database(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status code for this error. Kept as a bare `u16` so this crate
    /// never has to depend on `axum`/`http`; `main.rs` converts it.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) | AppError::PolicySchemaInvalid(_) => 422,
            AppError::WorkspaceMismatch => 403,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::Cache(_) | AppError::Database(_) => 503,
            AppError::Internal(_) => 500,
        }
    }

    /// The stable machine-readable code placed in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::PolicySchemaInvalid(_) => "POLICY_SCHEMA_INVALID",
            AppError::WorkspaceMismatch => "WORKSPACE_MISMATCH",
            AppError::Database(_) => "DATABASE_UNAVAILABLE",
            AppError::Cache(_) => "CACHE_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            detail: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        }
    }
}

/// `{ "detail": { "code": "<REASON>", "message": "<human>" } }` — spec §6.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub detail: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
