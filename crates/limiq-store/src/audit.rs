//! Per-workspace hash-chained audit log appender (spec §4.5).
//!
//! Ordering is obtained the way spec §5 allows: a `SELECT ... FOR UPDATE`
//! on the last row for the workspace, inside the same transaction the
//! caller uses to commit both the `requested` and the terminal event. That
//! row lock is this crate's advisory-lock-equivalent — it composes with the
//! caller's outer transaction, unlike a session-level Postgres advisory
//! lock, and needs no optimistic-retry loop the way the unique-constraint
//! approach from §5 would.

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::entities::AuditEvent;
use crate::error::StoreError;

/// Fixed genesis value hashed in place of a predecessor for `seq = 1`: 32
/// zero bytes, hex-encoded. Spec §3 names only "a fixed genesis value"; an
/// all-zero sentinel is the one this corpus's other hash-chain crate
/// (`abp-receipt`) effectively treats its root the same way.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const _: () = assert!(GENESIS_HASH.len() == 64, "genesis hash must be 64 hex chars (32 bytes)");

pub struct AppendAuditEvent<'a> {
    pub workspace_id: Uuid,
    pub event_type: &'a str,
    pub subject_type: &'a str,
    pub subject_id: Uuid,
    pub event_data: Value,
}

/// Append one audit event inside `tx`. Does not commit — the caller
/// controls the surrounding transaction (spec §4.5), so that the
/// `...requested` and terminal `...allowed`/`...denied` events the verify
/// engine emits become visible atomically, or not at all.
pub async fn append_audit_event(
    tx: &mut Transaction<'_, Postgres>,
    input: AppendAuditEvent<'_>,
) -> Result<AuditEvent, StoreError> {
    let prev: Option<(i64, String)> = sqlx::query_as(
        "SELECT seq, hash FROM audit_events WHERE workspace_id = $1 ORDER BY seq DESC LIMIT 1 FOR UPDATE",
    )
    .bind(input.workspace_id)
    .fetch_optional(&mut *tx)
    .await?;

    let (prev_seq, prev_hash) = prev.unwrap_or((0, GENESIS_HASH.to_string()));
    let seq = prev_seq + 1;
    // `timestamptz` stores microsecond precision; truncate before hashing
    // so the hashed representation matches what a later read-back produces
    // (`Utc::now()`'s nanosecond digits would otherwise not round-trip).
    let created_at: DateTime<Utc> = Utc::now().trunc_subsecs(6);

    let body = serde_json::json!({
        "workspace_id": input.workspace_id.to_string(),
        "seq": seq,
        "event_type": input.event_type,
        "subject_type": input.subject_type,
        "subject_id": input.subject_id.to_string(),
        "event_data": input.event_data,
        "created_at": created_at.to_rfc3339(),
    });
    let canonical = limiq_canonical::canonical_json_bytes(&body);
    let mut preimage = prev_hash.clone().into_bytes();
    preimage.extend_from_slice(&canonical);
    let hash = hex::encode(limiq_canonical::sha256(&preimage));

    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO audit_events
            (workspace_id, seq, event_type, subject_type, subject_id, event_data, prev_hash, hash, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING id",
    )
    .bind(input.workspace_id)
    .bind(seq)
    .bind(input.event_type)
    .bind(input.subject_type)
    .bind(input.subject_id)
    .bind(&input.event_data)
    .bind(&prev_hash)
    .bind(&hash)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await?;

    Ok(AuditEvent {
        id,
        workspace_id: input.workspace_id,
        seq,
        event_type: input.event_type.to_string(),
        subject_type: input.subject_type.to_string(),
        subject_id: input.subject_id,
        event_data: input.event_data,
        prev_hash,
        hash,
        created_at,
    })
}

/// Recompute the chain from a slice of events already ordered by `seq` and
/// return the index of the first broken link, if any. Backs the
/// audit-chain integrity-check endpoint (spec §1: explicitly in scope since
/// the verifier writes into this chain).
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), usize> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (index, event) in events.iter().enumerate() {
        if event.seq != (index as i64) + 1 {
            return Err(index);
        }
        if event.prev_hash != expected_prev {
            return Err(index);
        }
        let body = serde_json::json!({
            "workspace_id": event.workspace_id.to_string(),
            "seq": event.seq,
            "event_type": event.event_type,
            "subject_type": event.subject_type,
            "subject_id": event.subject_id.to_string(),
            "event_data": event.event_data,
            "created_at": event.created_at.to_rfc3339(),
        });
        let canonical = limiq_canonical::canonical_json_bytes(&body);
        let mut preimage = expected_prev.clone().into_bytes();
        preimage.extend_from_slice(&canonical);
        let recomputed = hex::encode(limiq_canonical::sha256(&preimage));
        if recomputed != event.hash {
            return Err(index);
        }
        expected_prev = event.hash.clone();
    }
    Ok(())
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
