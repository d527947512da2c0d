//! Principal resolution from sessions written by the identity provider.
//!
//! The token is read from the `session_token` cookie or an
//! `Authorization: Bearer` header. The first time a session is presented the
//! owner gets a login notification by mail.

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;

use crate::{
    models::principal::{Principal, Role},
    services::mail::Mailer,
};

pub const SESSION_COOKIE: &str = "session_token";

const UNKNOWN: &str = "Unknown";

/// Session token carried by the request, bearer header first.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Best guess at the client address for notifications.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The principal behind an unexpired session.
    async fn principal_for_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>, sqlx::Error>;

    /// Flag the session's login notice as sent. Only the first caller gets `true`.
    async fn claim_login_notice(&self, token: &str) -> Result<bool, sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<SqlitePool>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: String,
    role: Role,
    email: Option<String>,
    two_factor_enabled: bool,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn principal_for_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>, sqlx::Error> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT u.id, u.role, u.email, u.two_factor_enabled, s.expires_at
             FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.token = ?",
        )
        .bind(token)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.filter(|r| r.expires_at > now).map(|r| Principal {
            id: r.id,
            role: r.role,
            email: r.email,
            two_factor_enabled: r.two_factor_enabled,
        }))
    }

    async fn claim_login_notice(&self, token: &str) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE sessions SET login_notified = 1 WHERE token = ? AND login_notified = 0")
                .bind(token)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Clone)]
pub struct SessionResolver {
    store: Arc<dyn SessionStore>,
    mailer: Mailer,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn SessionStore>, mailer: Mailer) -> Self {
        Self { store, mailer }
    }

    /// Resolve the calling principal, if any.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>, sqlx::Error> {
        let Some(token) = session_token(headers) else {
            return Ok(None);
        };
        let Some(principal) = self.store.principal_for_token(&token, Utc::now()).await? else {
            tracing::debug!("unknown or expired session token");
            return Ok(None);
        };

        if self.store.claim_login_notice(&token).await? {
            if let Some(email) = principal.email.clone() {
                let mailer = self.mailer.clone();
                let ip = client_ip(headers);
                let user_agent = headers
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(UNKNOWN)
                    .to_string();
                tokio::spawn(async move {
                    mailer.send_login_notification(&email, &ip, &user_agent).await;
                });
            }
        }

        Ok(Some(principal))
    }
}
