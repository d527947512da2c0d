//! Public tenant reads, reached only through the host rewrite.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    errors::AppError,
    middleware::host_router::TenantHost,
    models::tenant::Tenant,
    services::{
        actions::post::{PostDetail, PostSummary},
        feed::{FEED_CONTENT_TYPE, render_feed},
        tenant_guard::{GuardError, TenantContext},
    },
    state::AppState,
};

/// The path segment must be the tenant the host router rewrote for; a
/// root-domain request to `/<key>` is not a tenant request.
fn host_key(tenant: Option<Extension<TenantHost>>, segment: &str) -> Result<String, AppError> {
    match tenant {
        Some(Extension(TenantHost(key))) if key == segment => Ok(key),
        _ => Err(AppError::not_found("Not found")),
    }
}

async fn resolve(state: &AppState, key: &str) -> Result<(TenantContext, Tenant), AppError> {
    state
        .guard()
        .resolve_public_tenant(key)
        .await
        .map_err(|err| match err {
            GuardError::Database(db) => db.into(),
            _ => AppError::not_found("Blog not found"),
        })
}

/// `GET /{tenant}`: the blog and its published posts.
pub async fn blog_home(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    tenant: Option<Extension<TenantHost>>,
) -> Result<Json<Value>, AppError> {
    let key = host_key(tenant, &segment)?;
    let (ctx, blog) = resolve(&state, &key).await?;
    let posts = state.cms.published_posts(&ctx).await?;

    Ok(Json(json!({
        "blog": {
            "id": blog.id,
            "name": blog.name,
            "subdomain": blog.subdomain,
            "customDomain": blog.custom_domain,
            "description": blog.description,
            "themeConfig": blog.theme_config,
        },
        "posts": posts,
    })))
}

/// `GET /{tenant}/posts/{slug}`
pub async fn blog_post(
    State(state): State<AppState>,
    Path((segment, slug)): Path<(String, String)>,
    tenant: Option<Extension<TenantHost>>,
) -> Result<Json<PostDetail>, AppError> {
    let key = host_key(tenant, &segment)?;
    let (ctx, _) = resolve(&state, &key).await?;
    state
        .cms
        .published_post(&ctx, &slug)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Post not found"))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

/// `GET /{tenant}/search?q=`: published posts matching the query.
pub async fn search_posts(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Query(params): Query<SearchParams>,
    tenant: Option<Extension<TenantHost>>,
) -> Result<Json<Vec<PostSummary>>, AppError> {
    let key = host_key(tenant, &segment)?;
    let (ctx, _) = resolve(&state, &key).await?;
    Ok(Json(state.cms.search_published_posts(&ctx, &params.q).await?))
}

/// `GET /{tenant}/rss`: RSS 2.0 feed with links on the requested host.
pub async fn blog_feed(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    tenant: Option<Extension<TenantHost>>,
) -> Result<Response, AppError> {
    let key = host_key(tenant, &segment)?;
    let (ctx, blog) = resolve(&state, &key).await?;
    let posts = state.cms.published_posts(&ctx).await?;

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(key.as_str());
    let scheme = if state.environment.is_production() { "https" } else { "http" };
    let xml = render_feed(&blog, &posts, &format!("{scheme}://{host}"), Utc::now());

    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(FEED_CONTENT_TYPE))],
        xml,
    )
        .into_response())
}
