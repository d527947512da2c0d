//! Static pages.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::{Cms, Deleted, conflict_as, resolve_slug, taxonomy::DeleteScopedInput};
use crate::{
    models::content::Page,
    services::{
        safe_action::{ActionContext, ActionFailure, SafeAction},
        tenant_guard::TenantContext,
    },
};

const PAGE_COLUMNS: &str =
    "id, blog_id, title, slug, content, published, meta_description, og_image, created_at";

const SLUG_TAKEN: &str = "A page with this slug already exists";

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PageFields {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
    #[validate(length(min = 1, max = 100, message = "Title must be 1-100 characters"))]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub published: bool,
    #[validate(length(max = 300, message = "Meta description must be at most 300 characters"))]
    pub meta_description: Option<String>,
    pub og_image: Option<String>,
}

impl Cms {
    /// Every page of a verified tenant, drafts included.
    pub async fn pages_for_owner(&self, tenant: &TenantContext) -> Result<Vec<Page>, sqlx::Error> {
        sqlx::query_as::<_, Page>(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE blog_id = ? ORDER BY created_at DESC"
        ))
        .bind(tenant.tenant_id())
        .fetch_all(&*self.db)
        .await
    }
}

pub struct CreatePage(pub Cms);

#[async_trait]
impl SafeAction for CreatePage {
    type Input = PageFields;
    type Output = Page;

    const NAME: &'static str = "createPage";

    async fn execute(&self, input: PageFields, ctx: ActionContext) -> anyhow::Result<Page> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let slug = resolve_slug(input.slug.as_deref(), &input.title)?;

        let page = sqlx::query_as::<_, Page>(&format!(
            "INSERT INTO pages ({PAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {PAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(tenant.tenant_id())
        .bind(&input.title)
        .bind(&slug)
        .bind(&input.content)
        .bind(input.published)
        .bind(&input.meta_description)
        .bind(&input.og_image)
        .bind(Utc::now())
        .fetch_one(&*cms.db)
        .await
        .map_err(|err| conflict_as(err, SLUG_TAKEN))?;
        Ok(page)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePageInput {
    #[validate(length(min = 1, message = "Page id is required"))]
    pub id: String,
    #[serde(flatten)]
    #[validate(nested)]
    pub fields: PageFields,
}

pub struct UpdatePage(pub Cms);

#[async_trait]
impl SafeAction for UpdatePage {
    type Input = UpdatePageInput;
    type Output = Page;

    const NAME: &'static str = "updatePage";

    async fn execute(&self, input: UpdatePageInput, ctx: ActionContext) -> anyhow::Result<Page> {
        let cms = &self.0;
        let UpdatePageInput { id, fields } = input;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&fields.blog_id, &ctx.principal_id)
            .await?;
        let slug = resolve_slug(fields.slug.as_deref(), &fields.title)?;

        let page = sqlx::query_as::<_, Page>(&format!(
            "UPDATE pages SET title = ?, slug = ?, content = ?, published = ?, meta_description = ?, og_image = ?
             WHERE id = ? AND blog_id = ?
             RETURNING {PAGE_COLUMNS}"
        ))
        .bind(&fields.title)
        .bind(&slug)
        .bind(&fields.content)
        .bind(fields.published)
        .bind(&fields.meta_description)
        .bind(&fields.og_image)
        .bind(&id)
        .bind(tenant.tenant_id())
        .fetch_optional(&*cms.db)
        .await
        .map_err(|err| conflict_as(err, SLUG_TAKEN))?
        .ok_or_else(|| ActionFailure::new("Page not found"))?;
        Ok(page)
    }
}

pub struct DeletePage(pub Cms);

#[async_trait]
impl SafeAction for DeletePage {
    type Input = DeleteScopedInput;
    type Output = Deleted;

    const NAME: &'static str = "deletePage";

    async fn execute(&self, input: DeleteScopedInput, ctx: ActionContext) -> anyhow::Result<Deleted> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let result = sqlx::query("DELETE FROM pages WHERE id = ? AND blog_id = ?")
            .bind(&input.id)
            .bind(tenant.tenant_id())
            .execute(&*cms.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ActionFailure::new("Page not found").into());
        }
        Ok(Deleted { id: input.id })
    }
}
