//! Host router.
//!
//! Runs in front of routing for every request:
//! - same-origin check for state-changing methods
//! - host classification into the root surface or a tenant
//! - tenant path rewrite `/<tenant><path>`
//! - a deterministic Content-Security-Policy on every response
//!
//! Requests without an `Origin` header skip the same-origin check; non-browser
//! clients are not covered by it.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, Uri, header, header::InvalidHeaderValue, uri::PathAndQuery},
    middleware::Next,
    response::Response,
};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Where a request is headed, decided from its `Host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostClass {
    /// The root/marketing domain or `www.` in front of it.
    Root,
    /// A tenant subdomain label or a full custom domain.
    Tenant(String),
}

/// Attached to rewritten requests so tenant handlers can tell a real tenant
/// host from a root-domain path that merely looks like one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantHost(pub String);

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_inclusive(']').next().unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

pub fn classify_host(host: &str, root_domain: &str) -> HostClass {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let root = root_domain.trim().to_ascii_lowercase();
    let host_name = strip_port(&host);
    let root_name = strip_port(&root);

    if host.is_empty() || host == root || host_name == root_name {
        return HostClass::Root;
    }

    let key = host
        .strip_suffix(&format!(".{root}"))
        .or_else(|| host_name.strip_suffix(&format!(".{root_name}")))
        .unwrap_or(host_name);

    if key.is_empty() || key == "www" {
        HostClass::Root
    } else {
        HostClass::Tenant(key.to_string())
    }
}

/// Platform paths that are served as-is on every host.
pub fn is_reserved_path(path: &str) -> bool {
    if path == "/api" || path.starts_with("/api/") || path.starts_with("/uploads/") {
        return true;
    }
    if path == "/healthz" || path == "/readyz" {
        return true;
    }
    // Root-level static files such as /favicon.ico or /robots.txt.
    matches!(path.rfind('/'), Some(0)) && path[1..].contains('.')
}

/// `/<tenant><path>` with the query string kept.
pub fn rewrite_target(tenant_key: &str, uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("/{tenant_key}{}?{query}", uri.path()),
        None => format!("/{tenant_key}{}", uri.path()),
    }
}

fn valid_tenant_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
        && !key.contains("..")
}

fn is_state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Same-origin check: the origin, scheme stripped, must equal `Host` exactly.
pub fn origin_allowed(method: &Method, origin: Option<&str>, host: Option<&str>) -> bool {
    if !is_state_changing(method) {
        return true;
    }
    let Some(origin) = origin else {
        return true;
    };
    let origin_host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    Some(origin_host) == host
}

fn is_loopback_url(app_url: &str) -> bool {
    let Ok(url) = url::Url::parse(app_url) else {
        return false;
    };
    match url.host() {
        Some(url::Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".localhost")
        }
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

/// Policy string; `img-src` also allows any source when the app runs on loopback.
pub fn content_security_policy(app_url: &str) -> String {
    let img_extra = if is_loopback_url(app_url) { " *" } else { "" };
    format!(
        "default-src 'self'; \
         script-src 'self' 'unsafe-eval' 'unsafe-inline'; \
         style-src 'self' 'unsafe-inline'; \
         img-src 'self' blob: data: https://*.s3.amazonaws.com https://res.cloudinary.com{img_extra}; \
         font-src 'self'; \
         object-src 'none'; \
         base-uri 'self'; \
         form-action 'self'; \
         frame-ancestors 'none'; \
         block-all-mixed-content; \
         upgrade-insecure-requests;"
    )
}

/// Per-process routing settings handed to [`host_router`].
#[derive(Clone, Debug)]
pub struct HostRouting {
    root_domain: String,
    csp: HeaderValue,
}

impl HostRouting {
    pub fn new(root_domain: &str, app_url: &str) -> Result<Self, InvalidHeaderValue> {
        Ok(Self {
            root_domain: root_domain.to_ascii_lowercase(),
            csp: HeaderValue::from_str(&content_security_policy(app_url))?,
        })
    }

    fn with_csp(&self, mut response: Response) -> Response {
        response
            .headers_mut()
            .insert(header::CONTENT_SECURITY_POLICY, self.csp.clone());
        response
    }

    fn reject(&self, status: StatusCode) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        self.with_csp(response)
    }
}

pub async fn host_router(
    State(routing): State<HostRouting>,
    mut req: Request,
    next: Next,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .map(str::to_string);
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());

    if !origin_allowed(req.method(), origin, host.as_deref()) {
        warn!(
            method = %req.method(),
            origin = origin.unwrap_or_default(),
            host = host.as_deref().unwrap_or_default(),
            "blocked cross-origin request"
        );
        return routing.reject(StatusCode::FORBIDDEN);
    }

    let class = host
        .as_deref()
        .map_or(HostClass::Root, |h| classify_host(h, &routing.root_domain));

    if let HostClass::Tenant(key) = class {
        if !is_reserved_path(req.uri().path()) {
            if !valid_tenant_key(&key) {
                debug!(tenant = %key, "rejecting malformed tenant host");
                return routing.reject(StatusCode::BAD_REQUEST);
            }

            let target = rewrite_target(&key, req.uri());
            let Ok(path_and_query) = PathAndQuery::try_from(target) else {
                return routing.reject(StatusCode::BAD_REQUEST);
            };
            let mut parts = req.uri().clone().into_parts();
            parts.path_and_query = Some(path_and_query);
            let Ok(uri) = Uri::from_parts(parts) else {
                return routing.reject(StatusCode::BAD_REQUEST);
            };

            debug!(tenant = %key, from = %req.uri().path(), to = %uri.path(), "tenant rewrite");
            *req.uri_mut() = uri;
            req.extensions_mut().insert(TenantHost(key));
        }
    }

    routing.with_csp(next.run(req).await)
}
