//! Posts: create, update with revisions and asset reconciliation, delete,
//! plus the owner and public read paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{Cms, Deleted, conflict_as, record_audit, resolve_slug, taxonomy::upsert_tags};
use crate::{
    models::content::{Post, Tag},
    services::{
        assets::{orphaned_keys, purge_orphans},
        safe_action::{ActionContext, ActionFailure, SafeAction},
        tenant_guard::TenantContext,
    },
};

const POST_COLUMNS: &str = "id, blog_id, author_id, title, slug, content, published, meta_description, \
     canonical_url, og_image, category_id, created_at, updated_at";

const SLUG_TAKEN: &str = "A post with this slug already exists";

/// Most results a public search returns.
pub const SEARCH_LIMIT: i64 = 20;

/// `%term%` with LIKE wildcards in the term taken literally (escape `\`).
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Fields shared by create and update.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PostFields {
    #[validate(length(min = 1, message = "Blog id is required"))]
    pub blog_id: String,
    #[validate(length(min = 1, max = 100, message = "Title must be 1-100 characters"))]
    pub title: String,
    #[validate(length(min = 1, message = "Content is required"))]
    pub content: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub published: bool,
    #[validate(length(max = 300, message = "Meta description must be at most 300 characters"))]
    pub meta_description: Option<String>,
    #[validate(url(message = "Canonical URL must be a valid URL"))]
    pub canonical_url: Option<String>,
    pub og_image: Option<String>,
    pub category_id: Option<String>,
    /// Tag names; created on the fly within the blog.
    #[validate(length(max = 20, message = "At most 20 tags per post"))]
    pub tags: Option<Vec<String>>,
}

impl Cms {
    async fn check_category(&self, tenant: &TenantContext, category_id: Option<&str>) -> anyhow::Result<()> {
        if let Some(id) = category_id {
            if self.category_in_tenant(tenant, id).await?.is_none() {
                return Err(ActionFailure::new("Category not found").into());
            }
        }
        Ok(())
    }

    async fn slug_in_use(&self, tenant: &TenantContext, slug: &str) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts WHERE blog_id = ? AND slug = ?")
            .bind(tenant.tenant_id())
            .bind(slug)
            .fetch_one(&*self.db)
            .await?;
        Ok(count > 0)
    }

    async fn post_in_tenant(&self, tenant: &TenantContext, post_id: &str) -> Result<Option<Post>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id = ? AND blog_id = ?"
        ))
        .bind(post_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&*self.db)
        .await
    }

    /// Every post of a verified tenant, drafts included, newest first.
    pub async fn posts_for_owner(&self, tenant: &TenantContext) -> Result<Vec<Post>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE blog_id = ? ORDER BY created_at DESC"
        ))
        .bind(tenant.tenant_id())
        .fetch_all(&*self.db)
        .await
    }

    /// Published posts for the public site, newest first.
    pub async fn published_posts(&self, tenant: &TenantContext) -> Result<Vec<Post>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE blog_id = ? AND published = 1 ORDER BY created_at DESC"
        ))
        .bind(tenant.tenant_id())
        .fetch_all(&*self.db)
        .await
    }

    /// Published posts whose title or content contains `query`, newest first.
    /// A blank query matches nothing.
    pub async fn search_published_posts(
        &self,
        tenant: &TenantContext,
        query: &str,
    ) -> Result<Vec<PostSummary>, sqlx::Error> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(query);
        sqlx::query_as::<_, PostSummary>(
            "SELECT id, title, slug, created_at FROM posts
             WHERE blog_id = ? AND published = 1
               AND (title LIKE ? ESCAPE '\\' OR content LIKE ? ESCAPE '\\')
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(tenant.tenant_id())
        .bind(&pattern)
        .bind(&pattern)
        .bind(SEARCH_LIMIT)
        .fetch_all(&*self.db)
        .await
    }

    /// One published post by slug.
    pub async fn published_post(
        &self,
        tenant: &TenantContext,
        slug: &str,
    ) -> Result<Option<PostDetail>, sqlx::Error> {
        let post = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE blog_id = ? AND slug = ? AND published = 1"
        ))
        .bind(tenant.tenant_id())
        .bind(slug)
        .fetch_optional(&*self.db)
        .await?;

        match post {
            Some(post) => {
                let tags = self.tags_for_post(&post.id).await?;
                Ok(Some(PostDetail { post, tags }))
            }
            None => Ok(None),
        }
    }
}

/// A search hit.
#[derive(Debug, Serialize, sqlx::FromRow, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostSummary {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PostDetail {
    #[serde(flatten)]
    pub post: Post,
    pub tags: Vec<Tag>,
}

pub struct CreatePost(pub Cms);

#[async_trait]
impl SafeAction for CreatePost {
    type Input = PostFields;
    type Output = Post;

    const NAME: &'static str = "createPost";

    async fn execute(&self, input: PostFields, ctx: ActionContext) -> anyhow::Result<Post> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        cms.check_category(&tenant, input.category_id.as_deref()).await?;

        let mut slug = resolve_slug(input.slug.as_deref(), &input.title)?;
        if cms.slug_in_use(&tenant, &slug).await? {
            slug = format!("{slug}-{}", Utc::now().timestamp_millis());
        }

        let now = Utc::now();
        let mut tx = cms.db.begin().await?;
        let post = sqlx::query_as::<_, Post>(&format!(
            "INSERT INTO posts ({POST_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {POST_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(tenant.tenant_id())
        .bind(&ctx.principal_id)
        .bind(&input.title)
        .bind(&slug)
        .bind(&input.content)
        .bind(input.published)
        .bind(&input.meta_description)
        .bind(&input.canonical_url)
        .bind(&input.og_image)
        .bind(&input.category_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| conflict_as(err, SLUG_TAKEN))?;

        if let Some(tags) = &input.tags {
            for tag_id in upsert_tags(&mut *tx, &tenant, tags).await? {
                sqlx::query("INSERT INTO post_tags (post_id, tag_id) VALUES (?, ?)")
                    .bind(&post.id)
                    .bind(tag_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        tracing::info!(post_id = %post.id, blog_id = %post.blog_id, "post created");
        record_audit(
            &cms.db,
            &ctx.principal_id,
            "CREATE_POST",
            "Post",
            format!("Created post: {} ({})", post.title, post.id),
        )
        .await;
        Ok(post)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePostInput {
    #[validate(length(min = 1, message = "Post id is required"))]
    pub id: String,
    #[serde(flatten)]
    #[validate(nested)]
    pub fields: PostFields,
}

pub struct UpdatePost(pub Cms);

#[async_trait]
impl SafeAction for UpdatePost {
    type Input = UpdatePostInput;
    type Output = Post;

    const NAME: &'static str = "updatePost";

    async fn execute(&self, input: UpdatePostInput, ctx: ActionContext) -> anyhow::Result<Post> {
        let cms = &self.0;
        let UpdatePostInput { id, fields } = input;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&fields.blog_id, &ctx.principal_id)
            .await?;
        let old = cms
            .post_in_tenant(&tenant, &id)
            .await?
            .ok_or_else(|| ActionFailure::new("Post not found"))?;
        cms.check_category(&tenant, fields.category_id.as_deref()).await?;

        let slug = match fields.slug.as_deref() {
            Some(provided) => resolve_slug(Some(provided), &fields.title)?,
            None => old.slug.clone(),
        };

        let mut tx = cms.db.begin().await?;
        sqlx::query(
            "INSERT INTO post_revisions (id, post_id, title, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&old.id)
        .bind(&old.title)
        .bind(&old.content)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, Post>(&format!(
            "UPDATE posts SET title = ?, content = ?, slug = ?, published = ?, meta_description = ?,
                 canonical_url = ?, og_image = ?, category_id = ?, updated_at = ?
             WHERE id = ? AND blog_id = ?
             RETURNING {POST_COLUMNS}"
        ))
        .bind(&fields.title)
        .bind(&fields.content)
        .bind(&slug)
        .bind(fields.published)
        .bind(&fields.meta_description)
        .bind(&fields.canonical_url)
        .bind(&fields.og_image)
        .bind(&fields.category_id)
        .bind(Utc::now())
        .bind(&old.id)
        .bind(tenant.tenant_id())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| conflict_as(err, SLUG_TAKEN))?;

        if let Some(tags) = &fields.tags {
            sqlx::query("DELETE FROM post_tags WHERE post_id = ?")
                .bind(&updated.id)
                .execute(&mut *tx)
                .await?;
            for tag_id in upsert_tags(&mut *tx, &tenant, tags).await? {
                sqlx::query("INSERT INTO post_tags (post_id, tag_id) VALUES (?, ?)")
                    .bind(&updated.id)
                    .bind(tag_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        let orphans = orphaned_keys(&old.content, &updated.content, &cms.storage.public_url_prefix());
        if !orphans.is_empty() {
            tracing::info!(post_id = %updated.id, count = orphans.len(), "purging orphaned assets");
        }
        purge_orphans(cms.storage.clone(), &tenant, orphans);

        Ok(updated)
    }
}

pub struct DeletePost(pub Cms);

#[async_trait]
impl SafeAction for DeletePost {
    type Input = super::taxonomy::DeleteScopedInput;
    type Output = Deleted;

    const NAME: &'static str = "deletePost";

    async fn execute(
        &self,
        input: super::taxonomy::DeleteScopedInput,
        ctx: ActionContext,
    ) -> anyhow::Result<Deleted> {
        let cms = &self.0;
        let tenant = cms
            .guard
            .resolve_owned_tenant(&input.blog_id, &ctx.principal_id)
            .await?;
        let result = sqlx::query("DELETE FROM posts WHERE id = ? AND blog_id = ?")
            .bind(&input.id)
            .bind(tenant.tenant_id())
            .execute(&*cms.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ActionFailure::new("Post not found").into());
        }
        Ok(Deleted { id: input.id })
    }
}
