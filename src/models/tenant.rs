//! Represents a tenant (blog): an independently branded site with one owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A blog served under `<subdomain>.<root domain>` or its own custom domain.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    /// Unique identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Globally unique subdomain label (lowercase letters, digits, hyphens).
    pub subdomain: String,

    /// Optional custom domain pointing at this blog.
    pub custom_domain: Option<String>,

    pub description: Option<String>,

    /// Opaque theme configuration (JSON text).
    pub theme_config: Option<String>,

    /// ID of the principal that owns this blog.
    pub owner_id: String,

    pub created_at: DateTime<Utc>,
}
