//! Owner reads under `/api/blogs`.

use axum::{
    Json,
    extract::{Path, State},
};

use super::extract::MaybePrincipal;
use crate::{
    errors::AppError,
    models::{content::Post, tenant::Tenant},
    state::AppState,
};

/// `GET /api/blogs`
pub async fn list_blogs(
    State(state): State<AppState>,
    principal: MaybePrincipal,
) -> Result<Json<Vec<Tenant>>, AppError> {
    let principal = principal.required()?;
    Ok(Json(state.cms.owned_blogs(&principal.id).await?))
}

/// `GET /api/blogs/{blog_id}/posts`, drafts included.
pub async fn list_owner_posts(
    State(state): State<AppState>,
    Path(blog_id): Path<String>,
    principal: MaybePrincipal,
) -> Result<Json<Vec<Post>>, AppError> {
    let principal = principal.required()?;
    let tenant = state
        .guard()
        .resolve_owned_tenant(&blog_id, &principal.id)
        .await?;
    Ok(Json(state.cms.posts_for_owner(&tenant).await?))
}
