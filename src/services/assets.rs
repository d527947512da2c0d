//! Orphaned-asset reconciliation for post content.
//!
//! Keys are found by scanning rich-text HTML for the storage backend's public
//! URL prefix. Anything referenced by the old content but not by the new one
//! is deleted in the background; failures are only logged. Only keys under
//! the acting tenant's prefix are ever deleted, since content is free-form
//! and may reference another tenant's uploads.

use std::{collections::BTreeSet, sync::Arc};
use tokio::task::JoinHandle;

use crate::services::{
    storage::{StorageAdapter, tenant_key_prefix},
    tenant_guard::TenantContext,
};

fn ends_key(c: char) -> bool {
    matches!(c, '"' | '\'' | '<' | '>' | ')') || c.is_whitespace()
}

/// Storage keys referenced in `html` through `public_url_prefix`.
pub fn extract_asset_keys(html: &str, public_url_prefix: &str) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    if public_url_prefix.is_empty() {
        return keys;
    }

    let mut rest = html;
    while let Some(pos) = rest.find(public_url_prefix) {
        let after = &rest[pos + public_url_prefix.len()..];
        let end = after.find(ends_key).unwrap_or(after.len());
        if end > 0 {
            keys.insert(after[..end].to_string());
        }
        rest = &after[end..];
    }
    keys
}

/// Keys present in `old_html` and absent from `new_html`.
pub fn orphaned_keys(old_html: &str, new_html: &str, public_url_prefix: &str) -> Vec<String> {
    let old = extract_asset_keys(old_html, public_url_prefix);
    let new = extract_asset_keys(new_html, public_url_prefix);
    old.difference(&new).cloned().collect()
}

/// Delete the keys owned by `tenant` on a background task. Keys outside the
/// tenant prefix are skipped. Returns `None` when there is nothing to do.
pub fn purge_orphans(
    storage: Arc<dyn StorageAdapter>,
    tenant: &TenantContext,
    keys: Vec<String>,
) -> Option<JoinHandle<()>> {
    let owned = format!("{}/", tenant_key_prefix(tenant));
    let (keys, foreign): (Vec<String>, Vec<String>) =
        keys.into_iter().partition(|key| key.starts_with(&owned));
    for key in &foreign {
        tracing::warn!(
            tenant_id = %tenant.tenant_id(),
            key = %key,
            "skipping orphaned asset outside tenant prefix"
        );
    }
    if keys.is_empty() {
        return None;
    }

    Some(tokio::spawn(async move {
        for key in keys {
            match storage.delete(&key).await {
                Ok(()) => tracing::debug!(key = %key, "purged orphaned asset"),
                Err(err) => tracing::warn!(key = %key, error = %err, "failed to purge orphaned asset"),
            }
        }
    }))
}
