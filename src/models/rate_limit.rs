//! Fixed-window rate limit counter.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One counter per opaque key, e.g. `createPost-<principalId>`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct RateLimitCounter {
    pub key: String,

    /// Requests seen in the current window; saturates at `limit + 1`.
    pub count: i64,

    /// Window end as unix milliseconds.
    pub expires_at: i64,
}
