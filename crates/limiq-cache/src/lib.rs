//! Revocation blacklist and fixed-window rate limiter (spec §4.4), both
//! backed by the same Redis client the teacher already wires up for
//! `last_open`/event tracking — generalized here from a single
//! connection-per-call helper into a small struct around `redis::Client`.

use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Clone)]
pub struct Cache {
    client: redis::Client,
}

/// Result of probing the revocation blacklist. `Unknown` is the outcome of
/// a cache I/O failure — the spec's conservative resolution (§9, Open
/// Questions) is to treat that as "not revoked, fall through to the durable
/// store", never as ALLOW-by-default on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationProbe {
    Revoked,
    NotRevoked,
    Unknown,
}

/// Result of the rate-limit increment. `Unknown` signals a cache I/O
/// failure; the caller applies `fail_open` to decide ALLOW/DENY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitProbe {
    Allowed,
    Denied,
    Unknown,
}

impl Cache {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    fn jti_key(jti: &str) -> String {
        format!("revoked:jti:{jti}")
    }

    fn rate_key(workspace_id: &str, agent_id: &str, action_type: &str, minute_bucket: i64) -> String {
        format!("rate:{workspace_id}:{agent_id}:{action_type}:{minute_bucket}")
    }

    /// Probe `revoked:jti:<jti>`. Never propagates a cache error to the
    /// caller — only `Unknown`.
    pub async fn probe_revoked(&self, jti: &str) -> RevocationProbe {
        let mut conn = match self.client.get_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable for revocation probe");
                return RevocationProbe::Unknown;
            }
        };

        match conn.exists::<_, bool>(Self::jti_key(jti)).await {
            Ok(true) => RevocationProbe::Revoked,
            Ok(false) => RevocationProbe::NotRevoked,
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable for revocation probe");
                RevocationProbe::Unknown
            }
        }
    }

    /// Write the tombstone with `ttl_seconds = max(1, exp - now)`, called
    /// when a capability is revoked.
    pub async fn blacklist(&self, jti: &str, ttl_seconds: i64) -> Result<(), CacheError> {
        let ttl_seconds = ttl_seconds.max(1) as u64;
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.set_ex(Self::jti_key(jti), 1, ttl_seconds).await?;
        Ok(())
    }

    /// Fixed-window counter check/increment (spec §4.4). `minute_bucket`
    /// is `floor(now_seconds / window_seconds)`, computed by the caller so
    /// this module stays free of wall-clock reads.
    pub async fn check_rate_limit(
        &self,
        workspace_id: &str,
        agent_id: &str,
        action_type: &str,
        minute_bucket: i64,
        limit: i64,
        key_ttl_seconds: i64,
    ) -> RateLimitProbe {
        let key = Self::rate_key(workspace_id, agent_id, action_type, minute_bucket);
        let mut conn = match self.client.get_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable for rate limit check");
                return RateLimitProbe::Unknown;
            }
        };

        let count: i64 = match conn.incr(&key, 1).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, workspace_id, agent_id, action_type, "redis unavailable for rate limit check");
                return RateLimitProbe::Unknown;
            }
        };

        if count == 1 {
            // Benign race: concurrent first-requests may both EXPIRE; TTL
            // set is idempotent (spec §5).
            if let Err(err) = conn.expire::<_, ()>(&key, key_ttl_seconds).await {
                tracing::warn!(error = %err, "redis unavailable setting rate limit key ttl");
            }
        }

        if count <= limit {
            RateLimitProbe::Allowed
        } else {
            RateLimitProbe::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes_match_spec() {
        assert_eq!(Cache::jti_key("abc"), "revoked:jti:abc");
        assert_eq!(
            Cache::rate_key("ws", "agent", "purchase", 12345),
            "rate:ws:agent:purchase:12345"
        );
    }

    #[tokio::test]
    async fn unreachable_redis_probe_is_unknown() {
        // Port 1 is not a Redis server; connection will fail.
        let cache = Cache::new("redis://127.0.0.1:1/").unwrap();
        assert_eq!(cache.probe_revoked("jti-x").await, RevocationProbe::Unknown);
    }

    #[tokio::test]
    async fn unreachable_redis_rate_limit_is_unknown() {
        let cache = Cache::new("redis://127.0.0.1:1/").unwrap();
        let probe = cache
            .check_rate_limit("ws", "agent", "purchase", 0, 10, 70)
            .await;
        assert_eq!(probe, RateLimitProbe::Unknown);
    }
}
