//! Represents the authenticated caller.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }
}

/// The principal behind a session, as established by the identity provider.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    pub email: Option<String>,
    pub two_factor_enabled: bool,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            email: None,
            two_factor_enabled: false,
        }
    }
}
