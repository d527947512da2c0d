//! Fixed-window rate limiting.
//!
//! Counters are keyed by an opaque string such as `"createPost-<principalId>"`.
//! The read-compare-write for one key is a single indivisible step in every
//! store: one upsert statement for SQLite, one critical section in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;

use crate::models::rate_limit::RateLimitCounter;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Source of "now" for window arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Storage for fixed-window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically create, reset or increment the counter for `key` and return
    /// its new state. A counter at or above `limit` is pinned to `limit + 1`.
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<RateLimitCounter, RateLimitError>;
}

/// Counters persisted in the `rate_limits` table.
#[derive(Clone)]
pub struct SqliteCounterStore {
    db: Arc<SqlitePool>,
}

impl SqliteCounterStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<RateLimitCounter, RateLimitError> {
        // SET expressions all see the pre-update row.
        let counter = sqlx::query_as::<_, RateLimitCounter>(
            r#"
            INSERT INTO rate_limits (key, count, expires_at)
            VALUES (?1, 1, ?2 + ?3)
            ON CONFLICT(key) DO UPDATE SET
                count = CASE
                    WHEN rate_limits.expires_at <= ?2 THEN 1
                    WHEN rate_limits.count < ?4 THEN rate_limits.count + 1
                    ELSE ?4 + 1
                END,
                expires_at = CASE
                    WHEN rate_limits.expires_at <= ?2 THEN ?2 + ?3
                    ELSE rate_limits.expires_at
                END
            RETURNING key, count, expires_at
            "#,
        )
        .bind(key)
        .bind(now_ms)
        .bind(window_ms)
        .bind(i64::from(limit))
        .fetch_one(&*self.db)
        .await?;
        Ok(counter)
    }
}

/// Process-local counters, for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, RateLimitCounter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<RateLimitCounter, RateLimitError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| RateLimitError::Unavailable("counter mutex poisoned".into()))?;
        let limit = i64::from(limit);
        let counter = counters
            .entry(key.to_string())
            .and_modify(|c| {
                if c.expires_at <= now_ms {
                    c.count = 1;
                    c.expires_at = now_ms + window_ms;
                } else if c.count < limit {
                    c.count += 1;
                } else {
                    c.count = limit + 1;
                }
            })
            .or_insert_with(|| RateLimitCounter {
                key: key.to_string(),
                count: 1,
                expires_at: now_ms + window_ms,
            });
        Ok(counter.clone())
    }
}

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Allow the request; availability wins over strict enforcement.
    FailOpen,
    /// Deny the request.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    policy: FailurePolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: FailurePolicy) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), policy)
    }

    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Count one request against `key` and report whether it fits in the window.
    pub async fn check(&self, key: &str, limit: u32, window_secs: u64) -> RateLimitDecision {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = i64::try_from(window_secs.saturating_mul(1000)).unwrap_or(i64::MAX / 2);

        match self.store.hit(key, limit, now_ms, window_ms).await {
            Ok(counter) => {
                let limit = i64::from(limit);
                RateLimitDecision {
                    allowed: counter.count <= limit,
                    remaining: u32::try_from((limit - counter.count).max(0)).unwrap_or(0),
                }
            }
            Err(err) => {
                tracing::error!(key, error = %err, policy = ?self.policy, "rate limit store failed");
                RateLimitDecision {
                    allowed: self.policy == FailurePolicy::FailOpen,
                    remaining: 0,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self(Mutex::new(Utc::now()))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn hit(&self, _: &str, _: u32, _: i64, _: i64) -> Result<RateLimitCounter, RateLimitError> {
            Err(RateLimitError::Unavailable("down".into()))
        }
    }

    async fn sqlite_store() -> Arc<dyn CounterStore> {
        let db = crate::db::connect_in_memory().await.unwrap();
        Arc::new(SqliteCounterStore::new(db))
    }

    async fn first_n_then_denied(store: Arc<dyn CounterStore>) {
        let limiter = RateLimiter::new(store, FailurePolicy::FailOpen);
        for expected_remaining in (0..3).rev() {
            let decision = limiter.check("createPost-u1", 3, 60).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.check("createPost-u1", 3, 60).await;
        assert_eq!(
            denied,
            RateLimitDecision {
                allowed: false,
                remaining: 0
            }
        );
        // Other keys are independent.
        assert!(limiter.check("createPost-u2", 3, 60).await.allowed);
    }

    #[tokio::test]
    async fn memory_store_allows_limit_then_denies() {
        first_n_then_denied(Arc::new(MemoryCounterStore::new())).await;
    }

    #[tokio::test]
    async fn sqlite_store_allows_limit_then_denies() {
        first_n_then_denied(sqlite_store().await).await;
    }

    async fn window_resets(store: Arc<dyn CounterStore>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(store, clock.clone(), FailurePolicy::FailOpen);

        assert!(limiter.check("upload-u1", 2, 60).await.allowed);
        assert!(limiter.check("upload-u1", 2, 60).await.allowed);
        assert!(!limiter.check("upload-u1", 2, 60).await.allowed);

        clock.advance(Duration::seconds(59));
        assert!(!limiter.check("upload-u1", 2, 60).await.allowed);

        clock.advance(Duration::seconds(1));
        let decision = limiter.check("upload-u1", 2, 60).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn memory_store_resets_after_window() {
        window_resets(Arc::new(MemoryCounterStore::new())).await;
    }

    #[tokio::test]
    async fn sqlite_store_resets_after_window() {
        window_resets(sqlite_store().await).await;
    }

    async fn concurrent_burst(store: Arc<dyn CounterStore>) {
        const LIMIT: u32 = 10;
        let limiter = RateLimiter::new(store, FailurePolicy::FailOpen);

        let handles: Vec<_> = (0..LIMIT * 2)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("burst", LIMIT, 60).await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, LIMIT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memory_store_never_double_allows() {
        concurrent_burst(Arc::new(MemoryCounterStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_store_never_double_allows() {
        concurrent_burst(sqlite_store().await).await;
    }

    #[tokio::test]
    async fn unreachable_store_follows_policy() {
        let open = RateLimiter::new(Arc::new(BrokenStore), FailurePolicy::FailOpen);
        assert!(open.check("k", 1, 60).await.allowed);

        let closed = RateLimiter::new(Arc::new(BrokenStore), FailurePolicy::FailClosed);
        assert!(!closed.check("k", 1, 60).await.allowed);
    }
}
