use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use limiq_cache::Cache;
use limiq_config::Settings;
use limiq_engine::{
    CapabilityKeys, CapabilityRequest, CapabilityResponse, IssueError, IssuerLimits,
    RateLimitSettings, VerifyRequest, VerifyResponse,
};
use limiq_errors::AppError;
use limiq_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

mod logging;

/// Process-wide state, mirroring the teacher's own `AppState` shape: a
/// signing/verifying keypair plus the two shared infrastructure handles,
/// all constructor-injected and cheap to clone.
#[derive(Clone)]
struct AppState {
    store: Store,
    cache: Cache,
    signing_key: Arc<SigningKey>,
    verifying_key: Arc<VerifyingKey>,
    settings: Arc<Settings>,
}

/// Thin `IntoResponse` wrapper around `limiq_errors::AppError` — the crate
/// is kept free of an `axum` dependency so `limiq-engine` can use the same
/// type without pulling in the HTTP framework.
struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_envelope())).into_response()
    }
}

#[tokio::main]
async fn main() {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    logging::init(&settings.log_level);

    let signing_key = match load_signing_key(&settings.jwt_private_key_pem) {
        Ok(key) => key,
        Err(err) => {
            error!(error = %err, "signing key material is malformed, refusing to start");
            std::process::exit(1);
        }
    };
    let verifying_key = match load_verifying_key(&settings.jwt_public_key_pem) {
        Ok(key) => key,
        Err(err) => {
            error!(error = %err, "verifying key material is malformed, refusing to start");
            std::process::exit(1);
        }
    };
    if verifying_key != signing_key.verifying_key() {
        warn!("configured verifying key does not match the signing key's own public half");
    }

    let store = match Store::connect(
        &settings.database_url,
        settings.db_pool_size,
        Duration::from_secs(settings.db_pool_acquire_timeout_seconds),
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to connect to the database, refusing to start");
            std::process::exit(1);
        }
    };

    let cache = match Cache::new(&settings.redis_url) {
        Ok(cache) => cache,
        Err(err) => {
            error!(error = %err, "failed to build the redis client, refusing to start");
            std::process::exit(1);
        }
    };

    let state = AppState {
        store,
        cache,
        signing_key: Arc::new(signing_key),
        verifying_key: Arc::new(verifying_key),
        settings: Arc::new(settings.clone()),
    };

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder installs exactly once per process");

    let cors = if settings.cors_allow_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = settings
            .cors_allow_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let app = Router::new()
        .route("/verify", post(verify_handler))
        .route("/capabilities/request", post(request_capability_handler))
        .route("/workspaces", post(create_workspace_handler))
        .route("/agents", post(create_agent_handler))
        .route("/agents/{id}", get(get_agent_handler))
        .route("/agents/{id}/revoke", post(revoke_agent_handler))
        .route("/agents/{id}/bind_policy", post(bind_policy_handler))
        .route("/policies", post(create_policy_handler))
        .route("/audit/{workspace_id}/verify", get(audit_integrity_handler))
        .route("/health", get(health_handler))
        .route(
            "/metrics",
            get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_logging))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = ([0, 0, 0, 0], settings.app_port).into();
    info!(%addr, "limiq listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app)
        .await
        .expect("server exited unexpectedly");
}

/// Accepts either bare base64 (standard, padded) or a PEM-armored block
/// around base64 content. No corpus crate parses real PKCS#8 PEM for raw
/// Ed25519 seeds, so the 32/64-byte payload is extracted directly —
/// documented as a resolved Open Question in DESIGN.md.
fn key_bytes_from_pem_or_b64(material: &str) -> Result<Vec<u8>, String> {
    let stripped: String = material
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let compact: String = stripped.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD
        .decode(&compact)
        .map_err(|err| format!("invalid base64 key material: {err}"))
}

fn load_signing_key(material: &str) -> Result<SigningKey, String> {
    let bytes = key_bytes_from_pem_or_b64(material)?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "signing key material must decode to 32 bytes".to_string())?;
    Ok(SigningKey::from_bytes(&seed))
}

fn load_verifying_key(material: &str) -> Result<VerifyingKey, String> {
    let bytes = key_bytes_from_pem_or_b64(material)?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "verifying key material must decode to 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&raw).map_err(|err| err.to_string())
}

/// Enforces the header/body workspace match required on every non-health
/// route (spec §6).
fn ensure_workspace_match(headers: &HeaderMap, claimed: Uuid) -> Result<(), ApiError> {
    let header_value = headers
        .get("X-Workspace-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::WorkspaceMismatch)?;
    let header_workspace: Uuid = header_value
        .parse()
        .map_err(|_| AppError::WorkspaceMismatch)?;
    if header_workspace != claimed {
        return Err(AppError::WorkspaceMismatch.into());
    }
    Ok(())
}

/// Emits one `http_request` JSON log line per request with
/// method/path/status/latency, mirroring the original service's
/// `request_logging.py` middleware (spec §7's structured-logging
/// correlation fields, for the fields `TraceLayer` doesn't already cover).
async fn request_logging(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started_at = std::time::Instant::now();

    let response = next.run(req).await;

    let latency_ms = started_at.elapsed().as_secs_f64() * 1000.0;
    info!(
        event_name = "http_request",
        %method,
        path,
        status = response.status().as_u16(),
        latency_ms,
        "http_request"
    );
    response
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.pool().acquire().await.is_ok();
    let cache_ok = !matches!(
        state.cache.probe_revoked("__health_check__").await,
        limiq_cache::RevocationProbe::Unknown
    );
    let body = serde_json::json!({ "database": db_ok, "cache": cache_ok });
    let status = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn verify_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    ensure_workspace_match(&headers, req.workspace_id)?;

    let capability_keys = CapabilityKeys {
        verifying_key: &state.verifying_key,
        kid: &state.settings.jwt_kid,
        leeway_seconds: state.settings.jwt_leeway_seconds,
    };
    let rate_limit_settings = RateLimitSettings {
        window_seconds: state.settings.rate_limit_window_seconds,
        key_ttl_seconds: state.settings.rate_limit_redis_key_ttl_seconds,
        fail_open: state.settings.rate_limit_redis_fail_open,
    };

    let started_at = std::time::Instant::now();
    let result = limiq_engine::verify_action(
        &state.store,
        &state.cache,
        &capability_keys,
        &rate_limit_settings,
        req,
    )
    .await;
    let latency_ms = started_at.elapsed().as_secs_f64() * 1000.0;

    match &result {
        Ok(response) => {
            let decision = format!("{:?}", response.decision).to_uppercase();
            let reason_code = response.reason_code.map(|r| r.as_str()).unwrap_or("none");
            metrics::counter!("limiq_verify_decisions_total", "decision" => decision, "reason_code" => reason_code)
                .increment(1);
            metrics::histogram!("limiq_verify_latency_ms").record(latency_ms);
        }
        Err(_) => {
            metrics::counter!("limiq_verify_errors_total").increment(1);
        }
    }

    let response = result.map_err(ApiError::from)?;
    Ok(Json(response))
}

async fn request_capability_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CapabilityRequest>,
) -> Result<(StatusCode, Json<CapabilityResponse>), ApiError> {
    ensure_workspace_match(&headers, req.workspace_id)?;

    let limits = IssuerLimits {
        default_ttl_minutes: state.settings.capability_default_ttl_minutes,
        min_ttl_minutes: state.settings.capability_min_ttl_minutes,
        max_ttl_minutes: state.settings.capability_max_ttl_minutes,
    };

    let response = limiq_engine::issue_capability(
        &state.store,
        &state.signing_key,
        &state.settings.jwt_kid,
        &limits,
        req,
    )
    .await
    .map_err(|err| match err {
        IssueError::AgentNotFound => ApiError(AppError::NotFound("agent not found".into())),
        IssueError::AgentRevoked => ApiError(AppError::BadRequest("agent is revoked".into())),
        IssueError::App(app_err) => ApiError(app_err),
    })?;

    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceRequest {
    #[serde(default)]
    id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct WorkspaceResponse {
    id: Uuid,
}

async fn create_workspace_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> Result<(StatusCode, Json<WorkspaceResponse>), ApiError> {
    let id = req.id.unwrap_or_else(Uuid::new_v4);
    let workspace = state
        .store
        .create_workspace(id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    Ok((StatusCode::CREATED, Json(WorkspaceResponse { id: workspace.id })))
}

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    workspace_id: Uuid,
    name: String,
    public_key: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Serialize)]
struct AgentResponse {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    status: String,
}

async fn create_agent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<AgentResponse>), ApiError> {
    ensure_workspace_match(&headers, req.workspace_id)?;

    let public_key_bytes = general_purpose::STANDARD
        .decode(&req.public_key)
        .map_err(|_| AppError::BadRequest("public_key must be valid base64".into()))?;
    if public_key_bytes.len() != 32 {
        return Err(AppError::BadRequest("public_key must decode to 32 bytes".into()).into());
    }
    let fingerprint = hex::encode(limiq_canonical::sha256(&public_key_bytes));

    let agent = state
        .store
        .create_agent(
            req.workspace_id,
            &req.name,
            &req.public_key,
            &fingerprint,
            req.metadata,
        )
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                AppError::Conflict("agent with this public key already exists".into())
            } else {
                AppError::Database(err.to_string())
            }
        })?;

    Ok((
        StatusCode::CREATED,
        Json(AgentResponse {
            id: agent.id,
            workspace_id: agent.workspace_id,
            name: agent.name,
            status: format!("{:?}", agent.status).to_lowercase(),
        }),
    ))
}

async fn get_agent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<AgentResponse>, ApiError> {
    let header_value = headers
        .get("X-Workspace-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::WorkspaceMismatch)?;
    let workspace_id: Uuid = header_value
        .parse()
        .map_err(|_| AppError::WorkspaceMismatch)?;

    let agent = state
        .store
        .get_agent(workspace_id, agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?
        .ok_or_else(|| AppError::NotFound("agent not found".into()))?;

    Ok(Json(AgentResponse {
        id: agent.id,
        workspace_id: agent.workspace_id,
        name: agent.name,
        status: format!("{:?}", agent.status).to_lowercase(),
    }))
}

#[derive(Debug, Deserialize)]
struct RevokeAgentRequest {
    workspace_id: Uuid,
}

async fn revoke_agent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent_id): Path<Uuid>,
    Json(req): Json<RevokeAgentRequest>,
) -> Result<Json<AgentResponse>, ApiError> {
    ensure_workspace_match(&headers, req.workspace_id)?;

    let mut tx = state
        .store
        .begin()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let agent = state
        .store
        .revoke_agent(&mut tx, req.workspace_id, agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?
        .ok_or_else(|| AppError::NotFound("agent not found".into()))?;
    limiq_store::append_audit_event(
        &mut tx,
        limiq_store::AppendAuditEvent {
            workspace_id: req.workspace_id,
            event_type: "agent.revoked",
            subject_type: "agent",
            subject_id: agent_id,
            event_data: serde_json::json!({}),
        },
    )
    .await
    .map_err(|err| AppError::Database(err.to_string()))?;
    tx.commit()
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    Ok(Json(AgentResponse {
        id: agent.id,
        workspace_id: agent.workspace_id,
        name: agent.name,
        status: format!("{:?}", agent.status).to_lowercase(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreatePolicyRequest {
    workspace_id: Uuid,
    name: String,
    version: i64,
    policy_json: Value,
}

#[derive(Debug, Serialize)]
struct PolicyResponse {
    id: Uuid,
    name: String,
    version: i64,
}

async fn create_policy_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreatePolicyRequest>,
) -> Result<(StatusCode, Json<PolicyResponse>), ApiError> {
    ensure_workspace_match(&headers, req.workspace_id)?;

    let policy_document: limiq_policy::PolicyDocument = serde_json::from_value(req.policy_json.clone())
        .map_err(|err| AppError::PolicySchemaInvalid(err.to_string()))?;
    let validated_json =
        serde_json::to_value(&policy_document).expect("typed policy document reserializes");

    let policy = state
        .store
        .create_policy(req.workspace_id, &req.name, req.version, 1, validated_json)
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                AppError::Conflict("policy version already exists".into())
            } else {
                AppError::Database(err.to_string())
            }
        })?;

    Ok((
        StatusCode::CREATED,
        Json(PolicyResponse {
            id: policy.id,
            name: policy.name,
            version: policy.version,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct BindPolicyRequest {
    workspace_id: Uuid,
    policy_id: Uuid,
}

#[derive(Debug, Serialize)]
struct BindPolicyResponse {
    agent_id: Uuid,
    policy_id: Uuid,
}

async fn bind_policy_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent_id): Path<Uuid>,
    Json(req): Json<BindPolicyRequest>,
) -> Result<Json<BindPolicyResponse>, ApiError> {
    ensure_workspace_match(&headers, req.workspace_id)?;

    let agent = state
        .store
        .get_agent(req.workspace_id, agent_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?
        .ok_or_else(|| AppError::NotFound("agent not found".into()))?;
    let policy = state
        .store
        .get_policy(req.workspace_id, req.policy_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?
        .ok_or_else(|| AppError::NotFound("policy not found".into()))?;

    let binding = state
        .store
        .bind_policy(req.workspace_id, agent.id, policy.id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;

    Ok(Json(BindPolicyResponse {
        agent_id: binding.agent_id,
        policy_id: binding.policy_id,
    }))
}

#[derive(Debug, Serialize)]
struct AuditIntegrityResponse {
    workspace_id: Uuid,
    event_count: usize,
    first_broken_index: Option<usize>,
}

async fn audit_integrity_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workspace_id): Path<Uuid>,
) -> Result<Json<AuditIntegrityResponse>, ApiError> {
    ensure_workspace_match(&headers, workspace_id)?;

    let events = state
        .store
        .audit_events_in_order(workspace_id)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let first_broken_index = limiq_store::verify_chain(&events).err();

    Ok(Json(AuditIntegrityResponse {
        workspace_id,
        event_count: events.len(),
        first_broken_index,
    }))
}

mod hex {
    pub fn encode(bytes: [u8; 32]) -> String {
        let mut out = String::with_capacity(64);
        for byte in bytes {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
