//! Tenant-scoped business operations.
//!
//! Each action is a [`SafeAction`] and is only ever invoked through the
//! [`ActionRunner`]. Owner operations obtain a `TenantContext` from the guard
//! first and scope every statement to `ctx.tenant_id()`.

pub mod blog;
pub mod export;
pub mod page;
pub mod post;
pub mod taxonomy;

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    models::{content::slugify, principal::Principal},
    services::{
        safe_action::{ActionFailure, ActionOutcome, ActionRunner, RawInput, SafeAction},
        storage::StorageAdapter,
        tenant_guard::TenantGuard,
    },
};

use blog::{CreateBlog, DeleteBlog, UpdateBlogSettings};
use export::ExportBlogData;
use page::{CreatePage, DeletePage, UpdatePage};
use post::{CreatePost, DeletePost, UpdatePost};
use taxonomy::{CreateCategory, CreateTag, DeleteCategory, DeleteTag};

/// Collaborators shared by all actions and tenant reads.
#[derive(Clone)]
pub struct Cms {
    pub(crate) db: Arc<SqlitePool>,
    pub(crate) guard: TenantGuard,
    pub(crate) storage: Arc<dyn StorageAdapter>,
}

impl Cms {
    pub fn new(db: Arc<SqlitePool>, guard: TenantGuard, storage: Arc<dyn StorageAdapter>) -> Self {
        Self { db, guard, storage }
    }

    pub fn guard(&self) -> &TenantGuard {
        &self.guard
    }
}

/// Result of a delete action.
#[derive(Debug, Serialize, PartialEq)]
pub struct Deleted {
    pub id: String,
}

/// Slug from the caller's value or derived from `source`.
pub(crate) fn resolve_slug(provided: Option<&str>, source: &str) -> Result<String, ActionFailure> {
    let slug = slugify(provided.filter(|s| !s.trim().is_empty()).unwrap_or(source));
    if slug.is_empty() {
        return Err(ActionFailure::new("Slug must contain letters or numbers"));
    }
    Ok(slug)
}

/// Turn a unique-constraint violation into a caller-facing failure.
pub(crate) fn conflict_as(err: sqlx::Error, message: &str) -> anyhow::Error {
    if err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
    {
        ActionFailure::new(message).into()
    } else {
        err.into()
    }
}

/// Best-effort audit trail entry.
pub(crate) async fn record_audit(
    db: &SqlitePool,
    user_id: &str,
    action: &str,
    resource: &str,
    details: String,
) {
    let result = sqlx::query(
        "INSERT INTO audit_logs (id, user_id, action, resource, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(action)
    .bind(resource)
    .bind(details)
    .bind(chrono::Utc::now())
    .execute(db)
    .await;

    if let Err(err) = result {
        tracing::warn!(action, error = %err, "failed to write audit log");
    }
}

/// Name-based dispatch over every registered action.
#[derive(Clone)]
pub struct ActionRegistry {
    runner: ActionRunner,
    cms: Cms,
}

impl ActionRegistry {
    pub const NAMES: &'static [&'static str] = &[
        CreateBlog::NAME,
        UpdateBlogSettings::NAME,
        DeleteBlog::NAME,
        ExportBlogData::NAME,
        CreatePost::NAME,
        UpdatePost::NAME,
        DeletePost::NAME,
        CreatePage::NAME,
        UpdatePage::NAME,
        DeletePage::NAME,
        CreateCategory::NAME,
        DeleteCategory::NAME,
        CreateTag::NAME,
        DeleteTag::NAME,
    ];

    pub fn new(runner: ActionRunner, cms: Cms) -> Self {
        Self { runner, cms }
    }

    /// Run the action called `name`. `None` when no such action exists.
    pub async fn dispatch(
        &self,
        name: &str,
        principal: Option<&Principal>,
        input: impl Into<RawInput>,
    ) -> Option<ActionOutcome<Value>> {
        let input = input.into();
        let runner = &self.runner;
        let cms = self.cms.clone();
        let outcome = match name {
            CreateBlog::NAME => runner.run_json(&CreateBlog(cms), principal, input).await,
            UpdateBlogSettings::NAME => {
                runner.run_json(&UpdateBlogSettings(cms), principal, input).await
            }
            DeleteBlog::NAME => runner.run_json(&DeleteBlog(cms), principal, input).await,
            ExportBlogData::NAME => runner.run_json(&ExportBlogData(cms), principal, input).await,
            CreatePost::NAME => runner.run_json(&CreatePost(cms), principal, input).await,
            UpdatePost::NAME => runner.run_json(&UpdatePost(cms), principal, input).await,
            DeletePost::NAME => runner.run_json(&DeletePost(cms), principal, input).await,
            CreatePage::NAME => runner.run_json(&CreatePage(cms), principal, input).await,
            UpdatePage::NAME => runner.run_json(&UpdatePage(cms), principal, input).await,
            DeletePage::NAME => runner.run_json(&DeletePage(cms), principal, input).await,
            CreateCategory::NAME => runner.run_json(&CreateCategory(cms), principal, input).await,
            DeleteCategory::NAME => runner.run_json(&DeleteCategory(cms), principal, input).await,
            CreateTag::NAME => runner.run_json(&CreateTag(cms), principal, input).await,
            DeleteTag::NAME => runner.run_json(&DeleteTag(cms), principal, input).await,
            _ => return None,
        };
        Some(outcome)
    }
}
