//! Core data models for the multi-tenant blog service.
//!
//! These entities map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`. Posts, pages and taxonomy are
//! opaque payloads to the isolation layer; only their owning tenant matters.

pub mod content;
pub mod principal;
pub mod rate_limit;
pub mod tenant;
