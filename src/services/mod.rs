pub mod actions;
pub mod assets;
pub mod feed;
pub mod mail;
pub mod rate_limiter;
pub mod safe_action;
pub mod sessions;
pub mod storage;
pub mod tenant_guard;
pub mod upload_policy;
