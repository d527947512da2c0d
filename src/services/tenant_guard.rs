//! Tenant scope guard.
//!
//! Every tenant-scoped query takes a `TenantContext`, and the only way to get
//! one is through this guard: the tenant must exist and, for owner
//! operations, belong to the calling principal. Ownership is re-read from the
//! store on every call.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::models::tenant::Tenant;

/// How long a public host lookup may be served from memory.
pub const PUBLIC_LOOKUP_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("tenant not found")]
    TenantNotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A tenant identifier that has been checked against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: String,
}

impl TenantContext {
    fn verified(tenant_id: String) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[cfg(test)]
    pub(crate) fn assume(tenant_id: &str) -> Self {
        Self::verified(tenant_id.to_string())
    }
}

/// Read access to tenant records.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn find_by_id(&self, tenant_id: &str) -> Result<Option<Tenant>, sqlx::Error>;

    /// Look a tenant up by subdomain, falling back to custom domain.
    async fn find_by_host_key(&self, host_key: &str) -> Result<Option<Tenant>, sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteTenantStore {
    db: Arc<SqlitePool>,
}

impl SqliteTenantStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

const TENANT_COLUMNS: &str =
    "id, name, subdomain, custom_domain, description, theme_config, owner_id, created_at";

#[async_trait]
impl TenantStore for SqliteTenantStore {
    async fn find_by_id(&self, tenant_id: &str) -> Result<Option<Tenant>, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(&format!("SELECT {TENANT_COLUMNS} FROM blogs WHERE id = ?"))
            .bind(tenant_id)
            .fetch_optional(&*self.db)
            .await
    }

    async fn find_by_host_key(&self, host_key: &str) -> Result<Option<Tenant>, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM blogs
             WHERE subdomain = ?1 OR custom_domain = ?1
             ORDER BY CASE WHEN subdomain = ?1 THEN 0 ELSE 1 END
             LIMIT 1"
        ))
        .bind(host_key)
        .fetch_optional(&*self.db)
        .await
    }
}

#[derive(Clone)]
pub struct TenantGuard {
    store: Arc<dyn TenantStore>,
    public_cache: Arc<DashMap<String, (Instant, Tenant)>>,
}

impl TenantGuard {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self {
            store,
            public_cache: Arc::new(DashMap::new()),
        }
    }

    /// Verify that `tenant_id` names an existing tenant.
    pub async fn resolve_tenant(&self, tenant_id: &str) -> Result<TenantContext, GuardError> {
        let tenant = self
            .store
            .find_by_id(tenant_id)
            .await?
            .ok_or(GuardError::TenantNotFound)?;
        Ok(TenantContext::verified(tenant.id))
    }

    /// Verify existence and that `principal_id` owns the tenant.
    ///
    /// Role is deliberately ignored: admins go through the same edge check.
    pub async fn resolve_owned_tenant(
        &self,
        tenant_id: &str,
        principal_id: &str,
    ) -> Result<TenantContext, GuardError> {
        let tenant = self
            .store
            .find_by_id(tenant_id)
            .await?
            .ok_or(GuardError::TenantNotFound)?;
        if tenant.owner_id != principal_id {
            tracing::warn!(tenant_id, principal_id, "ownership check failed");
            return Err(GuardError::Unauthorized);
        }
        Ok(TenantContext::verified(tenant.id))
    }

    /// Resolve the tenant behind a rewritten host key for public reads.
    pub async fn resolve_public_tenant(
        &self,
        host_key: &str,
    ) -> Result<(TenantContext, Tenant), GuardError> {
        if let Some(entry) = self.public_cache.get(host_key) {
            let (cached_at, tenant) = entry.value();
            if cached_at.elapsed() < PUBLIC_LOOKUP_TTL {
                return Ok((TenantContext::verified(tenant.id.clone()), tenant.clone()));
            }
        }

        let tenant = self
            .store
            .find_by_host_key(host_key)
            .await?
            .ok_or(GuardError::TenantNotFound)?;
        self.public_cache
            .insert(host_key.to_string(), (Instant::now(), tenant.clone()));
        Ok((TenantContext::verified(tenant.id.clone()), tenant))
    }

    /// Drop cached public lookups for a tenant after it changed or was deleted.
    pub fn forget(&self, tenant_id: &str) {
        self.public_cache
            .retain(|_, (_, tenant)| tenant.id != tenant_id);
    }
}
