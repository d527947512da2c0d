//! Owner export of a blog and everything it holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{Cms, record_audit};
use crate::{
    models::{
        content::{Category, Page, Post, Tag},
        tenant::Tenant,
    },
    services::safe_action::{ActionContext, SafeAction},
};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExportBlogInput {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlogExport {
    pub exported_at: DateTime<Utc>,
    pub blog: Tenant,
    pub posts: Vec<Post>,
    pub pages: Vec<Page>,
    pub categories: Vec<Category>,
    pub tags: Vec<Tag>,
}

pub struct ExportBlogData(pub Cms);

#[async_trait]
impl SafeAction for ExportBlogData {
    type Input = ExportBlogInput;
    type Output = BlogExport;

    const NAME: &'static str = "exportBlogData";

    fn rate_limit(&self) -> u32 {
        3
    }

    async fn execute(&self, input: ExportBlogInput, ctx: ActionContext) -> anyhow::Result<BlogExport> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;

        let blog = sqlx::query_as::<_, Tenant>(
            "SELECT id, name, subdomain, custom_domain, description, theme_config, owner_id, created_at
             FROM blogs WHERE id = ?",
        )
        .bind(tenant.tenant_id())
        .fetch_one(&*cms.db)
        .await?;

        let export = BlogExport {
            exported_at: Utc::now(),
            blog,
            posts: cms.posts_for_owner(&tenant).await?,
            pages: cms.pages_for_owner(&tenant).await?,
            categories: cms.categories_for_owner(&tenant).await?,
            tags: cms.tags_for_owner(&tenant).await?,
        };

        tracing::info!(
            blog_id = %tenant.tenant_id(),
            posts = export.posts.len(),
            pages = export.pages.len(),
            "blog exported"
        );
        record_audit(
            &cms.db,
            &ctx.principal_id,
            "EXPORT_BLOG",
            "Blog",
            format!("Exported blog {}", tenant.tenant_id()),
        )
        .await;
        Ok(export)
    }
}
