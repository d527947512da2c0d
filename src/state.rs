//! Shared application state handed to every handler.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    config::{AppConfig, Environment},
    services::{
        actions::{ActionRegistry, Cms},
        mail::Mailer,
        rate_limiter::{FailurePolicy, RateLimiter, SqliteCounterStore},
        safe_action::ActionRunner,
        sessions::{SessionResolver, SqliteSessionStore},
        storage::{self, StorageAdapter},
        tenant_guard::{SqliteTenantStore, TenantGuard},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub cms: Cms,
    pub actions: ActionRegistry,
    pub sessions: SessionResolver,
    pub limiter: RateLimiter,
    pub storage: Arc<dyn StorageAdapter>,
    pub environment: Environment,
}

impl AppState {
    /// Wire the services around an open pool and a storage backend.
    pub fn new(
        db: Arc<SqlitePool>,
        storage: Arc<dyn StorageAdapter>,
        mailer: Mailer,
        policy: FailurePolicy,
        environment: Environment,
    ) -> Self {
        let guard = TenantGuard::new(Arc::new(SqliteTenantStore::new(db.clone())));
        let limiter = RateLimiter::new(Arc::new(SqliteCounterStore::new(db.clone())), policy);
        let cms = Cms::new(db.clone(), guard, storage.clone());
        let actions = ActionRegistry::new(ActionRunner::new(limiter.clone(), environment), cms.clone());
        let sessions = SessionResolver::new(Arc::new(SqliteSessionStore::new(db.clone())), mailer);

        Self {
            db,
            cms,
            actions,
            sessions,
            limiter,
            storage,
            environment,
        }
    }

    /// Build every adapter named by the configuration.
    pub async fn from_config(cfg: &AppConfig, db: Arc<SqlitePool>) -> anyhow::Result<Self> {
        let storage = storage::build_storage(cfg).await?;
        let mailer = Mailer::from_config(&cfg.mail)?;
        let policy = if cfg.rate_limit_fail_closed {
            FailurePolicy::FailClosed
        } else {
            FailurePolicy::FailOpen
        };
        Ok(Self::new(db, storage, mailer, policy, cfg.environment))
    }

    pub fn guard(&self) -> &TenantGuard {
        self.cms.guard()
    }
}
