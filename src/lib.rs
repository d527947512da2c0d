//! Tenant isolation layer for a multi-tenant blog platform.
//!
//! Requests enter through the host router, owner operations run through the
//! safe action pipeline, and every tenant-scoped read or write goes through a
//! `TenantContext` issued by the tenant scope guard.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use routes::routes::app;
pub use state::AppState;
