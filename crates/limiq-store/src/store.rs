//! `Store`: a thin wrapper over a Postgres connection pool and the CRUD
//! operations the verify/issue engine and the admin routes need. Queries use
//! `sqlx::query_as`/`query_scalar` (runtime-checked) rather than the
//! `query!` macros, which require either a live database or a pre-built
//! offline cache at build time.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::entities::{Agent, AgentPolicyBinding, Capability, Policy, Revocation, Workspace};
use crate::error::StoreError;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: std::time::Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn create_workspace(&self, id: Uuid) -> Result<Workspace, StoreError> {
        let workspace = sqlx::query_as::<_, Workspace>(
            "INSERT INTO workspaces (id, created_at) VALUES ($1, now()) RETURNING id, created_at",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(workspace)
    }

    pub async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, StoreError> {
        let workspace =
            sqlx::query_as::<_, Workspace>("SELECT id, created_at FROM workspaces WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(workspace)
    }

    pub async fn create_agent(
        &self,
        workspace_id: Uuid,
        name: &str,
        public_key: &str,
        fingerprint: &str,
        metadata: Value,
    ) -> Result<Agent, StoreError> {
        let agent = sqlx::query_as::<_, Agent>(
            "INSERT INTO agents
                (id, workspace_id, name, public_key, fingerprint, status, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, 'active', $6, now())
             RETURNING id, workspace_id, name, public_key, fingerprint, status, metadata, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(name)
        .bind(public_key)
        .bind(fingerprint)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_unique_violation(err, "agent fingerprint already registered"))?;
        Ok(agent)
    }

    pub async fn get_agent(
        &self,
        workspace_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Agent>, StoreError> {
        let agent = sqlx::query_as::<_, Agent>(
            "SELECT id, workspace_id, name, public_key, fingerprint, status, metadata, created_at
             FROM agents WHERE workspace_id = $1 AND id = $2",
        )
        .bind(workspace_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(agent)
    }

    pub async fn revoke_agent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workspace_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Agent>, StoreError> {
        let agent = sqlx::query_as::<_, Agent>(
            "UPDATE agents SET status = 'revoked'
             WHERE workspace_id = $1 AND id = $2
             RETURNING id, workspace_id, name, public_key, fingerprint, status, metadata, created_at",
        )
        .bind(workspace_id)
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;
        Ok(agent)
    }

    pub async fn create_policy(
        &self,
        workspace_id: Uuid,
        name: &str,
        version: i64,
        schema_version: i64,
        policy_json: Value,
    ) -> Result<Policy, StoreError> {
        let policy = sqlx::query_as::<_, Policy>(
            "INSERT INTO policies
                (id, workspace_id, name, version, schema_version, policy_json, is_active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, true, now())
             RETURNING id, workspace_id, name, version, schema_version, policy_json, is_active, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(name)
        .bind(version)
        .bind(schema_version)
        .bind(policy_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_unique_violation(err, "policy version already exists"))?;
        Ok(policy)
    }

    pub async fn get_policy(
        &self,
        workspace_id: Uuid,
        policy_id: Uuid,
    ) -> Result<Option<Policy>, StoreError> {
        let policy = sqlx::query_as::<_, Policy>(
            "SELECT id, workspace_id, name, version, schema_version, policy_json, is_active, created_at
             FROM policies WHERE workspace_id = $1 AND id = $2",
        )
        .bind(workspace_id)
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(policy)
    }

    pub async fn bind_policy(
        &self,
        workspace_id: Uuid,
        agent_id: Uuid,
        policy_id: Uuid,
    ) -> Result<AgentPolicyBinding, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE agent_policy_bindings SET status = 'revoked'
             WHERE workspace_id = $1 AND agent_id = $2 AND status = 'active'",
        )
        .bind(workspace_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        let binding = sqlx::query_as::<_, AgentPolicyBinding>(
            "INSERT INTO agent_policy_bindings
                (id, workspace_id, agent_id, policy_id, status, bound_at)
             VALUES ($1, $2, $3, $4, 'active', now())
             RETURNING id, workspace_id, agent_id, policy_id, status, bound_at",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(agent_id)
        .bind(policy_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(binding)
    }

    /// The single active binding for an agent, joined to its policy
    /// document. `None` maps to `POLICY_NOT_BOUND` at the call site.
    pub async fn get_active_binding_with_policy(
        &self,
        workspace_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Policy>, StoreError> {
        let policy = sqlx::query_as::<_, Policy>(
            "SELECT p.id, p.workspace_id, p.name, p.version, p.schema_version, p.policy_json, p.is_active, p.created_at
             FROM agent_policy_bindings b
             JOIN policies p ON p.id = b.policy_id
             WHERE b.workspace_id = $1 AND b.agent_id = $2 AND b.status = 'active' AND p.is_active
             ORDER BY b.bound_at DESC LIMIT 1",
        )
        .bind(workspace_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(policy)
    }

    pub async fn create_capability(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workspace_id: Uuid,
        agent_id: Uuid,
        jti: &str,
        scopes: Value,
        limits: Value,
        issued_at: DateTime<Utc>,
        ttl_minutes: i64,
    ) -> Result<Capability, StoreError> {
        let expires_at = issued_at + Duration::minutes(ttl_minutes);
        let capability = sqlx::query_as::<_, Capability>(
            "INSERT INTO capabilities
                (id, workspace_id, agent_id, jti, scopes, limits, status, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8)
             RETURNING id, workspace_id, agent_id, jti, scopes, limits, status, issued_at, expires_at",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(agent_id)
        .bind(jti)
        .bind(scopes)
        .bind(limits)
        .bind(issued_at)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| map_unique_violation(err, "capability jti already exists"))?;
        Ok(capability)
    }

    pub async fn get_capability_by_jti(
        &self,
        workspace_id: Uuid,
        jti: &str,
    ) -> Result<Option<Capability>, StoreError> {
        let capability = sqlx::query_as::<_, Capability>(
            "SELECT id, workspace_id, agent_id, jti, scopes, limits, status, issued_at, expires_at
             FROM capabilities WHERE workspace_id = $1 AND jti = $2",
        )
        .bind(workspace_id)
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;
        Ok(capability)
    }

    pub async fn revoke_capability(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workspace_id: Uuid,
        jti: &str,
        reason: &str,
    ) -> Result<Option<Capability>, StoreError> {
        let capability = sqlx::query_as::<_, Capability>(
            "UPDATE capabilities SET status = 'revoked'
             WHERE workspace_id = $1 AND jti = $2
             RETURNING id, workspace_id, agent_id, jti, scopes, limits, status, issued_at, expires_at",
        )
        .bind(workspace_id)
        .bind(jti)
        .fetch_optional(&mut *tx)
        .await?;

        if capability.is_some() {
            sqlx::query(
                "INSERT INTO revocations (id, workspace_id, jti, revoked_at, reason)
                 VALUES ($1, $2, $3, now(), $4)",
            )
            .bind(Uuid::new_v4())
            .bind(workspace_id)
            .bind(jti)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
        }
        Ok(capability)
    }

    pub async fn find_revocation(
        &self,
        workspace_id: Uuid,
        jti: &str,
    ) -> Result<Option<Revocation>, StoreError> {
        let revocation = sqlx::query_as::<_, Revocation>(
            "SELECT id, workspace_id, jti, revoked_at, reason FROM revocations
             WHERE workspace_id = $1 AND jti = $2",
        )
        .bind(workspace_id)
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;
        Ok(revocation)
    }

    pub async fn audit_events_in_order(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<crate::entities::AuditEvent>, StoreError> {
        let events = sqlx::query_as::<_, crate::entities::AuditEvent>(
            "SELECT id, workspace_id, seq, event_type, subject_type, subject_id, event_data, prev_hash, hash, created_at
             FROM audit_events WHERE workspace_id = $1 ORDER BY seq ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

fn map_unique_violation(err: sqlx::Error, message: &str) -> StoreError {
    let store_err = StoreError::Database(err);
    if store_err.is_unique_violation() {
        StoreError::Conflict(message.to_string())
    } else {
        store_err
    }
}
