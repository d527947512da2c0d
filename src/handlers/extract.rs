//! Request extractors shared by handlers.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{errors::AppError, models::principal::Principal, state::AppState};

/// The session principal, if the request carries a valid session.
#[derive(Debug, Clone)]
pub struct MaybePrincipal(pub Option<Principal>);

impl MaybePrincipal {
    /// The principal, or `401 Unauthorized`.
    pub fn required(self) -> Result<Principal, AppError> {
        self.0.ok_or_else(AppError::unauthorized)
    }
}

impl FromRequestParts<AppState> for MaybePrincipal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let principal = state.sessions.resolve(&parts.headers).await?;
        Ok(Self(principal))
    }
}
