//! Defines routes for the platform API and the rewritten tenant surface.
//!
//! ## Structure
//! - **Platform endpoints** (served as-is on every host)
//!   - `GET  /healthz`, `GET /readyz`
//!   - `GET  /api/blogs`: the caller's blogs
//!   - `GET  /api/blogs/{blog_id}/posts`: owner post list, drafts included
//!   - `POST /api/actions/{action}`: named safe actions
//!   - `POST /api/upload`, `POST /api/upload/presign`
//!   - `GET  /uploads/{*key}`: files of the local storage backend
//!
//! - **Tenant endpoints** (reached through the host rewrite)
//!   - `GET /{tenant}`: blog home with published posts
//!   - `GET /{tenant}/posts/{slug}`: one published post
//!   - `GET /{tenant}/search?q=`: published posts matching a query
//!   - `GET /{tenant}/rss`: RSS feed of published posts

use crate::{
    handlers::{
        action_handlers::run_action,
        blog_handlers::{list_blogs, list_owner_posts},
        health_handlers::{healthz, readyz},
        public_handlers::{blog_feed, blog_home, blog_post, search_posts},
        upload_handlers::{presign, serve_upload, upload},
    },
    middleware::host_router::{HostRouting, host_router},
    services::upload_policy::MAX_UPLOAD_BYTES,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, header},
    middleware,
    routing::{get, post},
};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

/// Multipart framing on top of the largest accepted file.
const UPLOAD_BODY_LIMIT: usize = MAX_UPLOAD_BYTES + 64 * 1024;

/// Build the router for every handler; the router carries `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // owner API
        .route("/api/blogs", get(list_blogs))
        .route("/api/blogs/{blog_id}/posts", get(list_owner_posts))
        .route("/api/actions/{action}", post(run_action))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/upload/presign", post(presign))
        .route("/uploads/{*key}", get(serve_upload))
        // tenant surface
        .route("/{tenant}", get(blog_home))
        .route("/{tenant}/", get(blog_home))
        .route("/{tenant}/posts/{slug}", get(blog_post))
        .route("/{tenant}/search", get(search_posts))
        .route("/{tenant}/rss", get(blog_feed))
}

/// The full service: host routing runs in front of route matching so the
/// tenant rewrite decides which route is hit.
pub fn app(state: AppState, routing: HostRouting) -> Router {
    Router::new()
        .fallback_service(routes().with_state(state))
        .layer(middleware::from_fn_with_state(routing, host_router))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
}
