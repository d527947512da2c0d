use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
};
use blog_tenancy::{
    AppState, app,
    config::Environment,
    db,
    middleware::host_router::HostRouting,
    services::{
        mail::Mailer,
        rate_limiter::FailurePolicy,
        storage::{LocalStorageAdapter, StorageAdapter},
    },
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const ROOT: &str = "example.com";
const APP_URL: &str = "http://localhost:3000";
const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

/// Users `alice` and `mallory` with bearer sessions of the same name; blog
/// `b1` (`demo`) owned by alice and `b2` (`other`) owned by mallory.
async fn test_app() -> Router {
    let db = db::connect_in_memory().await.unwrap();
    for user in ["alice", "mallory"] {
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?)")
            .bind(user)
            .bind(format!("{user}@example.com"))
            .bind(Utc::now())
            .execute(&*db)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(user)
            .bind(user)
            .bind(Utc::now() + Duration::hours(1))
            .execute(&*db)
            .await
            .unwrap();
    }
    for (id, subdomain, owner, custom) in [
        ("b1", "demo", "alice", Some("blog.alice.dev")),
        ("b2", "other", "mallory", None),
    ] {
        sqlx::query(
            "INSERT INTO blogs (id, name, subdomain, custom_domain, owner_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("{subdomain} blog"))
        .bind(subdomain)
        .bind(custom)
        .bind(owner)
        .bind(Utc::now())
        .execute(&*db)
        .await
        .unwrap();
    }

    let dir = std::env::temp_dir().join(format!("blog-tenancy-http-{}", Uuid::new_v4()));
    let storage: Arc<dyn StorageAdapter> =
        Arc::new(LocalStorageAdapter::new(dir, APP_URL).await.unwrap());
    let state = AppState::new(
        db,
        storage,
        Mailer::disabled(),
        FailurePolicy::FailOpen,
        Environment::Development,
    );
    app(state, HostRouting::new(ROOT, APP_URL).unwrap())
}

async fn body_bytes(res: Response<Body>) -> Vec<u8> {
    res.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(res: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(res).await).unwrap()
}

fn get(host: &str, path: &str, token: Option<&str>) -> Request<Body> {
    let mut req = Request::get(path).header(header::HOST, host);
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    req.body(Body::empty()).unwrap()
}

fn action(name: &str, token: Option<&str>, body: Value) -> Request<Body> {
    raw_action(name, token, body.to_string())
}

fn raw_action(name: &str, token: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut req = Request::post(format!("/api/actions/{name}"))
        .header(header::HOST, ROOT)
        .header(header::ORIGIN, format!("https://{ROOT}"))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    req.body(body.into()).unwrap()
}

fn upload(token: Option<&str>, blog_id: Option<&str>, content_type: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "XBOUNDARYX";
    let mut body = Vec::new();
    if let Some(blog_id) = blog_id {
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"blogId\"\r\n\r\n{blog_id}\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"x\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let mut req = Request::post("/api/upload")
        .header(header::HOST, ROOT)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"));
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    req.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn every_response_carries_security_headers() {
    let res = test_app().await.oneshot(get(ROOT, "/healthz", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let csp = res.headers()[header::CONTENT_SECURITY_POLICY].to_str().unwrap();
    assert!(csp.contains("frame-ancestors 'none'"));
    assert!(csp.contains("https://res.cloudinary.com *;"));
    assert_eq!(res.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(
        res.headers()[header::REFERRER_POLICY],
        "strict-origin-when-cross-origin"
    );
}

#[tokio::test]
async fn cross_origin_action_is_rejected_before_it_runs() {
    let app = test_app().await;
    let req = Request::post("/api/actions/deleteBlog")
        .header(header::HOST, ROOT)
        .header(header::ORIGIN, "https://evil.com")
        .header(header::AUTHORIZATION, "Bearer alice")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "blogId": "b1" }).to_string()))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert!(res.headers().contains_key(header::CONTENT_SECURITY_POLICY));
    assert!(body_bytes(res).await.is_empty());

    let res = app.oneshot(get("demo.example.com", "/", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn published_posts_are_served_on_the_tenant_host_only() {
    let app = test_app().await;
    let published = json!({ "blogId": "b1", "title": "Hello World", "content": "<p>hi</p>", "published": true, "tags": ["Rust"] });
    let res = app.clone().oneshot(action("createPost", Some("alice"), published)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let created = body_json(res).await;
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["slug"], "hello-world");

    let draft = json!({ "blogId": "b1", "title": "Draft", "content": "wip" });
    let res = app.clone().oneshot(action("createPost", Some("alice"), draft)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.clone().oneshot(get("demo.example.com", "/", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let home = body_json(res).await;
    assert_eq!(home["blog"]["subdomain"], "demo");
    assert!(home["blog"].get("ownerId").is_none());
    assert_eq!(home["posts"].as_array().unwrap().len(), 1);

    let res = app
        .clone()
        .oneshot(get("demo.example.com", "/posts/hello-world?ref=feed", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let post = body_json(res).await;
    assert_eq!(post["title"], "Hello World");
    assert_eq!(post["tags"][0]["name"], "Rust");

    let res = app.clone().oneshot(get("demo.example.com", "/posts/draft", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app.clone().oneshot(get("blog.alice.dev", "/", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Same path on the root domain is not a tenant request.
    let res = app.clone().oneshot(get(ROOT, "/demo", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app.oneshot(get("nobody.example.com", "/", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn search_and_feed_cover_published_posts_on_the_tenant_host() {
    let app = test_app().await;
    for (title, published) in [("Rust & Tokio", true), ("Rust draft", false)] {
        let body = json!({ "blogId": "b1", "title": title, "content": "<p>async</p>", "published": published });
        let res = app.clone().oneshot(action("createPost", Some("alice"), body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(get("demo.example.com", "/search?q=rust", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let hits = body_json(res).await;
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["slug"], "rust-tokio");

    let res = app.clone().oneshot(get("other.example.com", "/search?q=rust", None)).await.unwrap();
    assert_eq!(body_json(res).await, json!([]));

    let res = app.clone().oneshot(get("demo.example.com", "/rss", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/rss+xml; charset=utf-8"
    );
    let xml = String::from_utf8(body_bytes(res).await).unwrap();
    assert!(xml.contains("<title>Rust &amp; Tokio</title>"));
    assert!(xml.contains("<link>http://demo.example.com/posts/rust-tokio</link>"));
    assert!(!xml.contains("Rust draft"));

    let res = app.clone().oneshot(get(ROOT, "/demo/rss", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = app.oneshot(get("nobody.example.com", "/rss", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn export_is_owner_only() {
    let app = test_app().await;

    let res = app
        .clone()
        .oneshot(action("exportBlogData", Some("mallory"), json!({ "blogId": "b1" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .oneshot(action("exportBlogData", Some("alice"), json!({ "blogId": "b1" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let export = body_json(res).await;
    assert_eq!(export["data"]["blog"]["customDomain"], "blog.alice.dev");
    assert_eq!(export["data"]["posts"], json!([]));
}

#[tokio::test]
async fn action_pipeline_maps_failures_to_statuses() {
    let app = test_app().await;

    let res = app
        .clone()
        .oneshot(action("createTag", None, json!({ "blogId": "b1", "name": "Rust" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(res).await, json!({ "success": false, "error": "Unauthorized" }));

    let res = app
        .clone()
        .oneshot(action("createTag", Some("mallory"), json!({ "blogId": "b1", "name": "Rust" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .clone()
        .oneshot(action("createTag", Some("alice"), json!({ "blogId": "b1" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert!(body["error"].as_str().unwrap().starts_with("Invalid input:"));

    let res = app
        .clone()
        .oneshot(action("createBlog", Some("mallory"), json!({ "name": "Copy", "subdomain": "demo" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(res).await["error"], "Subdomain already taken");

    let res = app.oneshot(action("dropTables", Some("alice"), json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_action_body_reports_the_decode_error() {
    let app = test_app().await;
    let broken = r#"{"blogId": "b1", "name": "#;

    let res = app.clone().oneshot(raw_action("createTag", None, broken)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .oneshot(raw_action("createTag", Some("alice"), broken))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let error = body_json(res).await["error"].as_str().unwrap().to_string();
    assert!(error.starts_with("Invalid input: Malformed JSON body:"), "{error}");
    assert!(error.contains("EOF"), "{error}");
}

#[tokio::test]
async fn action_rate_limit_is_per_principal() {
    let app = test_app().await;
    for i in 0..3 {
        let res = app
            .clone()
            .oneshot(action("deleteBlog", Some("alice"), json!({ "blogId": format!("missing-{i}") })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
    let res = app
        .clone()
        .oneshot(action("deleteBlog", Some("alice"), json!({ "blogId": "b1" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        body_json(res).await["error"],
        "Rate limit exceeded. Please try again later."
    );

    let res = app
        .oneshot(action("deleteBlog", Some("mallory"), json!({ "blogId": "b2" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn owner_reads_are_guarded() {
    let app = test_app().await;

    let res = app.clone().oneshot(get(ROOT, "/api/blogs", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app.clone().oneshot(get(ROOT, "/api/blogs", Some("alice"))).await.unwrap();
    let blogs = body_json(res).await;
    assert_eq!(blogs.as_array().unwrap().len(), 1);
    assert_eq!(blogs[0]["id"], "b1");

    let res = app
        .clone()
        .oneshot(get(ROOT, "/api/blogs/b1/posts", Some("mallory")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(res).await["error"], "Unauthorized access to blog");

    let res = app
        .clone()
        .oneshot(get(ROOT, "/api/blogs/ghost/posts", Some("alice")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = app
        .oneshot(get(ROOT, "/api/blogs/b1/posts", Some("alice")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_checks_run_in_order_and_file_is_served() {
    let app = test_app().await;

    let res = app.clone().oneshot(upload(None, Some("b1"), "image/png", PNG)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app.clone().oneshot(upload(Some("alice"), None, "image/png", PNG)).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app.clone().oneshot(upload(Some("mallory"), Some("b1"), "image/png", PNG)).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = app
        .clone()
        .oneshot(upload(Some("alice"), Some("b1"), "image/jpeg", PNG))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(res).await["error"],
        "File signature mismatch (Magic Number check failed)"
    );

    let svg = b"<svg><script>alert(1)</script></svg>";
    let res = app
        .clone()
        .oneshot(upload(Some("alice"), Some("b1"), "image/svg+xml", svg))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app.clone().oneshot(upload(Some("alice"), Some("b1"), "image/png", PNG)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let public_url = body_json(res).await["publicUrl"].as_str().unwrap().to_string();
    let path = public_url.strip_prefix(APP_URL).unwrap();
    assert!(path.starts_with("/uploads/tenants/b1/"));
    assert!(path.ends_with(".png"));

    // Served on any host, tenant hosts included.
    let res = app.clone().oneshot(get("demo.example.com", path, None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(body_bytes(res).await, PNG);

    let res = app
        .oneshot(get(ROOT, "/uploads/tenants/b1/missing.png", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn uploads_are_rate_limited_per_principal() {
    let app = test_app().await;
    for _ in 0..5 {
        let res = app.clone().oneshot(upload(Some("alice"), Some("b1"), "image/png", PNG)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = app.oneshot(upload(Some("alice"), Some("b1"), "image/png", PNG)).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn presign_needs_an_object_store_backend() {
    let app = test_app().await;
    let req = Request::post("/api/upload/presign")
        .header(header::HOST, ROOT)
        .header(header::AUTHORIZATION, "Bearer alice")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "blogId": "b1", "contentType": "image/png", "size": 1024 }).to_string(),
        ))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn readiness_reports_sqlite_and_disk() {
    let res = test_app().await.oneshot(get(ROOT, "/readyz", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "local");
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["storage"]["ok"], true);
}
