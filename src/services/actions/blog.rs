//! Blog lifecycle: create, settings, delete, and the owner's blog list.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{Cms, Deleted, conflict_as, record_audit};
use crate::{
    models::tenant::Tenant,
    services::safe_action::{ActionContext, ActionFailure, SafeAction},
};

const SUBDOMAIN_TAKEN: &str = "Subdomain already taken";

/// Subdomains the platform keeps for itself.
const RESERVED_SUBDOMAINS: &[&str] = &["www", "api", "app", "admin", "uploads"];

fn validate_subdomain(value: &str) -> Result<(), ValidationError> {
    if !value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(ValidationError::new("subdomain").with_message(
            "Subdomain must contain only lowercase letters, numbers, and hyphens".into(),
        ));
    }
    if RESERVED_SUBDOMAINS.contains(&value) {
        return Err(ValidationError::new("subdomain").with_message("Subdomain is reserved".into()));
    }
    Ok(())
}

fn validate_json(value: &str) -> Result<(), ValidationError> {
    serde_json::from_str::<serde_json::Value>(value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("json").with_message("Theme config must be valid JSON".into()))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBlogInput {
    #[validate(length(min = 1, max = 50, message = "Blog name must be 1-50 characters"))]
    pub name: String,
    #[validate(
        length(min = 3, max = 20, message = "Subdomain must be 3-20 characters"),
        custom(function = validate_subdomain)
    )]
    pub subdomain: String,
}

pub struct CreateBlog(pub Cms);

#[async_trait]
impl SafeAction for CreateBlog {
    type Input = CreateBlogInput;
    type Output = Tenant;

    const NAME: &'static str = "createBlog";

    async fn execute(&self, input: CreateBlogInput, ctx: ActionContext) -> anyhow::Result<Tenant> {
        let db = &*self.0.db;

        let taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blogs WHERE subdomain = ?")
            .bind(&input.subdomain)
            .fetch_one(db)
            .await?;
        if taken > 0 {
            return Err(ActionFailure::new(SUBDOMAIN_TAKEN).into());
        }

        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            subdomain: input.subdomain,
            custom_domain: None,
            description: None,
            theme_config: None,
            owner_id: ctx.principal_id.clone(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO blogs (id, name, subdomain, owner_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.subdomain)
        .bind(&tenant.owner_id)
        .bind(tenant.created_at)
        .execute(db)
        .await
        .map_err(|err| conflict_as(err, SUBDOMAIN_TAKEN))?;

        tracing::info!(blog_id = %tenant.id, subdomain = %tenant.subdomain, "blog created");
        record_audit(
            db,
            &ctx.principal_id,
            "CREATE_BLOG",
            "Blog",
            format!("Created blog: {} ({})", tenant.name, tenant.id),
        )
        .await;
        Ok(tenant)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBlogSettingsInput {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
    #[validate(custom(function = validate_json))]
    pub theme_config: Option<String>,
}

pub struct UpdateBlogSettings(pub Cms);

#[async_trait]
impl SafeAction for UpdateBlogSettings {
    type Input = UpdateBlogSettingsInput;
    type Output = Tenant;

    const NAME: &'static str = "updateBlogSettings";

    async fn execute(
        &self,
        input: UpdateBlogSettingsInput,
        ctx: ActionContext,
    ) -> anyhow::Result<Tenant> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;

        let updated = sqlx::query_as::<_, Tenant>(
            "UPDATE blogs
             SET description = COALESCE(?, description),
                 theme_config = COALESCE(?, theme_config)
             WHERE id = ?
             RETURNING id, name, subdomain, custom_domain, description, theme_config, owner_id, created_at",
        )
        .bind(input.description)
        .bind(input.theme_config)
        .bind(tenant.tenant_id())
        .fetch_optional(&*cms.db)
        .await?
        .ok_or_else(|| ActionFailure::new("Blog not found"))?;

        cms.guard.forget(tenant.tenant_id());
        record_audit(
            &cms.db,
            &ctx.principal_id,
            "UPDATE_SETTINGS",
            "Blog",
            format!("Updated settings for blog {}", tenant.tenant_id()),
        )
        .await;
        Ok(updated)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBlogInput {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
}

pub struct DeleteBlog(pub Cms);

#[async_trait]
impl SafeAction for DeleteBlog {
    type Input = DeleteBlogInput;
    type Output = Deleted;

    const NAME: &'static str = "deleteBlog";

    fn rate_limit(&self) -> u32 {
        3
    }

    async fn execute(&self, input: DeleteBlogInput, ctx: ActionContext) -> anyhow::Result<Deleted> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;

        // Posts, pages and taxonomy go with it through ON DELETE CASCADE.
        sqlx::query("DELETE FROM blogs WHERE id = ?")
            .bind(tenant.tenant_id())
            .execute(&*cms.db)
            .await?;
        cms.guard.forget(tenant.tenant_id());

        tracing::info!(blog_id = %tenant.tenant_id(), "blog deleted");
        record_audit(
            &cms.db,
            &ctx.principal_id,
            "DELETE_BLOG",
            "Blog",
            format!("Deleted blog {}", tenant.tenant_id()),
        )
        .await;
        Ok(Deleted {
            id: tenant.tenant_id().to_string(),
        })
    }
}

impl Cms {
    /// Blogs owned by `principal_id`, newest first.
    pub async fn owned_blogs(&self, principal_id: &str) -> Result<Vec<Tenant>, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(
            "SELECT id, name, subdomain, custom_domain, description, theme_config, owner_id, created_at
             FROM blogs WHERE owner_id = ? ORDER BY created_at DESC",
        )
        .bind(principal_id)
        .fetch_all(&*self.db)
        .await
    }
}
