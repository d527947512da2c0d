//! Tenant asset uploads and local file serving.
//!
//! Checks run in a fixed order: principal, required fields, tenant ownership,
//! content policy, rate limit. Only then are bytes handed to storage.

use axum::{
    Json,
    body::Body,
    extract::{
        Path, State,
        multipart::{Multipart, MultipartError},
    },
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::ErrorKind;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use super::extract::MaybePrincipal;
use crate::{
    errors::AppError,
    services::{
        storage::{PresignedUpload, tenant_key_prefix},
        upload_policy::{UPLOAD_LIMIT, UPLOAD_WINDOW_SECS, check_presign, check_upload},
    },
    state::AppState,
};

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

async fn enforce_upload_limit(state: &AppState, principal_id: &str) -> Result<(), AppError> {
    let decision = state
        .limiter
        .check(&format!("upload-{principal_id}"), UPLOAD_LIMIT, UPLOAD_WINDOW_SECS)
        .await;
    if !decision.allowed {
        tracing::info!(principal_id, "upload rate limited");
        return Err(AppError::too_many_requests());
    }
    Ok(())
}

/// `POST /api/upload` with multipart fields `file` and `blogId`.
pub async fn upload(
    State(state): State<AppState>,
    principal: MaybePrincipal,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let principal = principal.required()?;

    let mut file: Option<(String, Bytes)> = None;
    let mut blog_id: Option<String> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("file") => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((content_type, bytes));
            }
            Some("blogId") => {
                blog_id = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let (Some((content_type, bytes)), Some(blog_id)) = (file, blog_id.filter(|id| !id.is_empty()))
    else {
        return Err(AppError::bad_request("Missing file or blogId"));
    };

    let tenant = state
        .guard()
        .resolve_owned_tenant(&blog_id, &principal.id)
        .await?;

    check_upload(&content_type, &bytes).map_err(|rejection| {
        tracing::warn!(principal_id = %principal.id, blog_id, %rejection, "upload rejected");
        AppError::bad_request(rejection.to_string())
    })?;

    enforce_upload_limit(&state, &principal.id).await?;

    let stored = state
        .storage
        .upload(bytes, &content_type, &tenant_key_prefix(&tenant))
        .await?;
    tracing::info!(blog_id = %tenant.tenant_id(), key = %stored.key, "asset uploaded");
    Ok(Json(json!({ "publicUrl": stored.public_url })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub blog_id: String,
    pub content_type: String,
    pub size: u64,
}

/// `POST /api/upload/presign`
pub async fn presign(
    State(state): State<AppState>,
    principal: MaybePrincipal,
    Json(req): Json<PresignRequest>,
) -> Result<Json<PresignedUpload>, AppError> {
    let principal = principal.required()?;
    let tenant = state
        .guard()
        .resolve_owned_tenant(&req.blog_id, &principal.id)
        .await?;

    check_presign(&req.content_type, req.size)
        .map_err(|rejection| AppError::bad_request(rejection.to_string()))?;
    enforce_upload_limit(&state, &principal.id).await?;

    let presigned = state
        .storage
        .presign(&req.content_type, req.size, &tenant_key_prefix(&tenant))
        .await?;
    Ok(Json(presigned))
}

fn content_type_for(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext) {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// `GET /uploads/{*key}` streams a file written by the local backend.
pub async fn serve_upload(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let not_found = || AppError::not_found("File not found");
    let path = state
        .storage
        .as_local()
        .and_then(|local| local.path_for(&key))
        .ok_or_else(not_found)?;

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(err) => return Err(anyhow::Error::from(err).into()),
    };
    let size = file.metadata().await.map_err(anyhow::Error::from)?.len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&key)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok(response)
}
