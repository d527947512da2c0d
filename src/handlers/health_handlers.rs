//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and, for the
//!   local backend, upload directory I/O

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path, time::Instant};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Cheap liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let started = Instant::now();
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {v}")),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };
    checks.insert("sqlite", sqlite.timed(started));

    if let Some(local) = state.storage.as_local() {
        let started = Instant::now();
        checks.insert("storage", disk_check(local.upload_dir()).await.timed(started));
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        storage: state.storage.backend_name(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Write, read back and remove a probe file under `dir`.
async fn disk_check(dir: &Path) -> CheckStatus {
    let tmp_path = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::failed(format!("could not write tmp file: {e}"));
    }
    let read = fs::read(&tmp_path).await;
    let removed = fs::remove_file(&tmp_path).await;
    match (read, removed) {
        (Ok(bytes), Ok(())) if bytes == b"readyz" => CheckStatus::ok(),
        (Ok(bytes), Err(e)) if bytes == b"readyz" => CheckStatus {
            ok: true,
            error: Some(format!("could not remove tmp file: {e}")),
            latency_ms: None,
        },
        (Ok(_), _) => CheckStatus::failed("file content mismatch".into()),
        (Err(e), _) => CheckStatus::failed(format!("could not read tmp file: {e}")),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    storage: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
    latency_ms: Option<u64>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            latency_ms: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
            latency_ms: None,
        }
    }

    fn timed(mut self, started: Instant) -> Self {
        self.latency_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        self
    }
}
