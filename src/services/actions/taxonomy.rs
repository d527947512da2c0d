//! Categories and tags.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqliteConnection;
use uuid::Uuid;
use validator::Validate;

use super::{Cms, Deleted, conflict_as, resolve_slug};
use crate::{
    models::content::{Category, Tag, slugify},
    services::{
        safe_action::{ActionContext, ActionFailure, SafeAction},
        tenant_guard::TenantContext,
    },
};

/// Find-or-create tags by name within one tenant and return their ids.
/// Names that slugify to nothing are skipped, duplicates collapse.
pub(crate) async fn upsert_tags(
    conn: &mut SqliteConnection,
    tenant: &TenantContext,
    names: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    let mut ids: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        let slug = slugify(name);
        if slug.is_empty() {
            continue;
        }

        sqlx::query(
            "INSERT INTO tags (id, blog_id, name, slug) VALUES (?, ?, ?, ?)
             ON CONFLICT(blog_id, slug) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant.tenant_id())
        .bind(name)
        .bind(&slug)
        .execute(&mut *conn)
        .await?;

        let id = sqlx::query_scalar::<_, String>("SELECT id FROM tags WHERE blog_id = ? AND slug = ?")
            .bind(tenant.tenant_id())
            .bind(&slug)
            .fetch_one(&mut *conn)
            .await?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCategoryInput {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
    #[validate(length(min = 1, max = 50, message = "Name must be 1-50 characters"))]
    pub name: String,
    pub slug: Option<String>,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
    pub parent_id: Option<String>,
}

pub struct CreateCategory(pub Cms);

#[async_trait]
impl SafeAction for CreateCategory {
    type Input = CreateCategoryInput;
    type Output = Category;

    const NAME: &'static str = "createCategory";

    async fn execute(&self, input: CreateCategoryInput, ctx: ActionContext) -> anyhow::Result<Category> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let slug = resolve_slug(input.slug.as_deref(), &input.name)?;

        if let Some(parent_id) = input.parent_id.as_deref() {
            if cms.category_in_tenant(&tenant, parent_id).await?.is_none() {
                return Err(ActionFailure::new("Parent category not found").into());
            }
        }

        let category = sqlx::query_as::<_, Category>(
            "INSERT INTO categories (id, blog_id, name, slug, description, parent_id)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id, blog_id, name, slug, description, parent_id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant.tenant_id())
        .bind(&input.name)
        .bind(&slug)
        .bind(&input.description)
        .bind(&input.parent_id)
        .fetch_one(&*cms.db)
        .await
        .map_err(|err| conflict_as(err, "A category with this slug already exists"))?;
        Ok(category)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeleteScopedInput {
    #[validate(length(min = 1, message = "Id is required"))]
    pub id: String,
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
}

pub struct DeleteCategory(pub Cms);

#[async_trait]
impl SafeAction for DeleteCategory {
    type Input = DeleteScopedInput;
    type Output = Deleted;

    const NAME: &'static str = "deleteCategory";

    async fn execute(&self, input: DeleteScopedInput, ctx: ActionContext) -> anyhow::Result<Deleted> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let result = sqlx::query("DELETE FROM categories WHERE id = ? AND blog_id = ?")
            .bind(&input.id)
            .bind(tenant.tenant_id())
            .execute(&*cms.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ActionFailure::new("Category not found").into());
        }
        Ok(Deleted { id: input.id })
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagInput {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
    #[validate(length(min = 1, max = 50, message = "Name must be 1-50 characters"))]
    pub name: String,
    pub slug: Option<String>,
}

pub struct CreateTag(pub Cms);

#[async_trait]
impl SafeAction for CreateTag {
    type Input = CreateTagInput;
    type Output = Tag;

    const NAME: &'static str = "createTag";

    async fn execute(&self, input: CreateTagInput, ctx: ActionContext) -> anyhow::Result<Tag> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let slug = resolve_slug(input.slug.as_deref(), &input.name)?;

        let tag = sqlx::query_as::<_, Tag>(
            "INSERT INTO tags (id, blog_id, name, slug) VALUES (?, ?, ?, ?)
             RETURNING id, blog_id, name, slug",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant.tenant_id())
        .bind(input.name.trim())
        .bind(&slug)
        .fetch_one(&*cms.db)
        .await
        .map_err(|err| conflict_as(err, "A tag with this slug already exists"))?;
        Ok(tag)
    }
}

pub struct DeleteTag(pub Cms);

#[async_trait]
impl SafeAction for DeleteTag {
    type Input = DeleteScopedInput;
    type Output = Deleted;

    const NAME: &'static str = "deleteTag";

    async fn execute(&self, input: DeleteScopedInput, ctx: ActionContext) -> anyhow::Result<Deleted> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let result = sqlx::query("DELETE FROM tags WHERE id = ? AND blog_id = ?")
            .bind(&input.id)
            .bind(tenant.tenant_id())
            .execute(&*cms.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ActionFailure::new("Tag not found").into());
        }
        Ok(Deleted { id: input.id })
    }
}

impl Cms {
    pub(crate) async fn category_in_tenant(
        &self,
        tenant: &TenantContext,
        category_id: &str,
    ) -> Result<Option<Category>, sqlx::Error> {
        sqlx::query_as::<_, Category>(
            "SELECT id, blog_id, name, slug, description, parent_id
             FROM categories WHERE id = ? AND blog_id = ?",
        )
        .bind(category_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn categories_for_owner(&self, tenant: &TenantContext) -> Result<Vec<Category>, sqlx::Error> {
        sqlx::query_as::<_, Category>(
            "SELECT id, blog_id, name, slug, description, parent_id
             FROM categories WHERE blog_id = ? ORDER BY name",
        )
        .bind(tenant.tenant_id())
        .fetch_all(&*self.db)
        .await
    }

    pub async fn tags_for_owner(&self, tenant: &TenantContext) -> Result<Vec<Tag>, sqlx::Error> {
        sqlx::query_as::<_, Tag>("SELECT id, blog_id, name, slug FROM tags WHERE blog_id = ? ORDER BY name")
            .bind(tenant.tenant_id())
            .fetch_all(&*self.db)
            .await
    }

    /// Tags attached to a post.
    pub async fn tags_for_post(&self, post_id: &str) -> Result<Vec<Tag>, sqlx::Error> {
        sqlx::query_as::<_, Tag>(
            "SELECT t.id, t.blog_id, t.name, t.slug
             FROM tags t JOIN post_tags pt ON pt.tag_id = t.id
             WHERE pt.post_id = ? ORDER BY t.name",
        )
        .bind(post_id)
        .fetch_all(&*self.db)
        .await
    }
}
