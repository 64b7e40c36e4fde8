use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
}

impl StoreError {
    /// `true` when the underlying failure is a unique-constraint violation
    /// (Postgres SQLSTATE `23505`) — the signal `create_policy` uses to map
    /// a duplicate `(workspace_id, name, version)` to `409
    /// POLICY_VERSION_ALREADY_EXISTS` instead of a generic 500.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db_err)) => {
                db_err.code().as_deref() == Some("23505")
            }
            StoreError::Conflict(_) => true,
            _ => false,
        }
    }
}
