//! Storage adapters: one capability interface, two backends.
//!
//! - `LocalStorageAdapter` writes beneath an upload directory served at
//!   `<app_url>/uploads/…`.
//! - `S3StorageAdapter` talks to AWS S3 or any S3-compatible endpoint.
//!
//! Keys are always generated here (`<prefix>/<uuid>.<ext>`); callers never
//! choose a filename. Deletes are confined to the `tenants/` namespace.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client, error::DisplayErrorContext, presigning::PresigningConfig,
    primitives::ByteStream as AwsByteStream,
};
use bytes::Bytes;
use serde::Serialize;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::{AppConfig, StorageConfig},
    services::tenant_guard::TenantContext,
};

/// Every tenant-owned key lives under this namespace.
pub const TENANT_PREFIX_MARKER: &str = "tenants/";

/// Lifetime of presigned upload URLs.
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(300);

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("{0}")]
    Unsupported(&'static str),
    #[error("object store request failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub key: String,
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub public_url: String,
    pub key: String,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Store `bytes` under a freshly generated key beneath `key_prefix`.
    async fn upload(
        &self,
        bytes: Bytes,
        content_type: &str,
        key_prefix: &str,
    ) -> StorageResult<StoredObject>;

    /// Delete by bare key or full public URL. Keys outside the tenant
    /// namespace are ignored.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Time-limited direct upload URL.
    async fn presign(
        &self,
        _content_type: &str,
        _size: u64,
        _key_prefix: &str,
    ) -> StorageResult<PresignedUpload> {
        Err(StorageError::Unsupported("presigned uploads"))
    }

    /// URL prefix every public object URL of this backend starts with.
    fn public_url_prefix(&self) -> String;

    fn backend_name(&self) -> &'static str;

    /// The filesystem backend, when this is one; its files are served by the app.
    fn as_local(&self) -> Option<&LocalStorageAdapter> {
        None
    }
}

/// Key prefix for objects owned by a verified tenant.
pub fn tenant_key_prefix(tenant: &TenantContext) -> String {
    format!("{TENANT_PREFIX_MARKER}{}", tenant.tenant_id())
}

/// Build `<prefix>/<uuid>.<ext>` from the declared content type.
pub fn generate_key(key_prefix: &str, content_type: &str) -> String {
    let prefix = key_prefix.trim_matches('/');
    let name = format!("{}.{}", Uuid::new_v4(), extension_for(content_type));
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

/// File extension derived from a MIME subtype, `bin` when unusable.
pub fn extension_for(content_type: &str) -> String {
    let subtype = content_type
        .split(';')
        .next()
        .and_then(|essence| essence.split('/').nth(1))
        .unwrap_or("")
        .split('+')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric()) {
        "bin".to_string()
    } else {
        subtype
    }
}

/// Reject keys that could escape the storage root.
fn ensure_key_safe(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StorageError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::InvalidObjectKey);
    }
    Ok(())
}

/// Resolve a delete request to a relative key inside the tenant namespace.
///
/// Returns `None` when the request must be ignored: no tenant marker, a URL
/// that does not belong to this backend, or an unsafe key.
pub fn deletable_key(key_or_url: &str, public_url_prefix: &str) -> Option<String> {
    if !key_or_url.contains(TENANT_PREFIX_MARKER) {
        return None;
    }

    let relative = if let Some(rest) = key_or_url.strip_prefix(public_url_prefix) {
        rest
    } else if key_or_url.starts_with("http://") || key_or_url.starts_with("https://") {
        return None;
    } else {
        key_or_url
    };

    if !relative.starts_with(TENANT_PREFIX_MARKER) || ensure_key_safe(relative).is_err() {
        return None;
    }
    Some(relative.to_string())
}

/// Local filesystem backend.
#[derive(Clone, Debug)]
pub struct LocalStorageAdapter {
    upload_dir: PathBuf,
    app_url: String,
}

impl LocalStorageAdapter {
    /// Create the adapter, making sure the upload directory exists.
    pub async fn new(upload_dir: impl Into<PathBuf>, app_url: &str) -> StorageResult<Self> {
        let upload_dir = upload_dir.into();
        fs::create_dir_all(&upload_dir).await?;
        Ok(Self {
            upload_dir,
            app_url: app_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Absolute path of a stored key, if the key is safe.
    pub fn path_for(&self, key: &str) -> Option<PathBuf> {
        ensure_key_safe(key).ok()?;
        Some(self.upload_dir.join(key))
    }

    /// Remove empty directories from `start` up to (excluding) the upload root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.upload_dir) && current != self.upload_dir {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for LocalStorageAdapter {
    async fn upload(
        &self,
        bytes: Bytes,
        content_type: &str,
        key_prefix: &str,
    ) -> StorageResult<StoredObject> {
        let key = generate_key(key_prefix, content_type);
        let file_path = self.path_for(&key).ok_or(StorageError::InvalidObjectKey)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!(key = %key, size = bytes.len(), "stored local object");
        Ok(StoredObject {
            public_url: format!("{}{}", self.public_url_prefix(), key),
            key,
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let Some(relative) = deletable_key(key, &self.public_url_prefix()) else {
            debug!(key, "ignoring delete outside tenant namespace");
            return Ok(());
        };
        let Some(file_path) = self.path_for(&relative) else {
            return Ok(());
        };

        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    fn public_url_prefix(&self) -> String {
        format!("{}/uploads/", self.app_url)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn as_local(&self) -> Option<&LocalStorageAdapter> {
        Some(self)
    }
}

/// AWS S3 / S3-compatible backend.
#[derive(Clone)]
pub struct S3StorageAdapter {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

impl S3StorageAdapter {
    pub async fn new(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    ) -> Self {
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "static");

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let aws_config = loader.load().await;

        // Custom endpoints (MinIO and friends) want path-style addressing.
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(endpoint.is_some())
                .build(),
        );

        Self {
            client,
            bucket,
            region,
            endpoint,
        }
    }

    fn backend_error(err: impl std::error::Error) -> StorageError {
        StorageError::Backend(DisplayErrorContext(err).to_string())
    }
}

#[async_trait]
impl StorageAdapter for S3StorageAdapter {
    async fn upload(
        &self,
        bytes: Bytes,
        content_type: &str,
        key_prefix: &str,
    ) -> StorageResult<StoredObject> {
        let key = generate_key(key_prefix, content_type);
        ensure_key_safe(&key)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(AwsByteStream::from(bytes))
            .send()
            .await
            .map_err(Self::backend_error)?;

        Ok(StoredObject {
            public_url: format!("{}{}", self.public_url_prefix(), key),
            key,
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let Some(relative) = deletable_key(key, &self.public_url_prefix()) else {
            debug!(key, "ignoring delete outside tenant namespace");
            return Ok(());
        };

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&relative)
            .send()
            .await
            .map_err(Self::backend_error)?;
        Ok(())
    }

    async fn presign(
        &self,
        content_type: &str,
        size: u64,
        key_prefix: &str,
    ) -> StorageResult<PresignedUpload> {
        let key = generate_key(key_prefix, content_type);
        ensure_key_safe(&key)?;

        let presigning = PresigningConfig::expires_in(PRESIGN_EXPIRY).map_err(Self::backend_error)?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .content_length(i64::try_from(size).map_err(|_| StorageError::InvalidObjectKey)?)
            .presigned(presigning)
            .await
            .map_err(Self::backend_error)?;

        Ok(PresignedUpload {
            upload_url: request.uri().to_string(),
            public_url: format!("{}{}", self.public_url_prefix(), key),
            key,
        })
    }

    fn public_url_prefix(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/", endpoint, self.bucket),
            None => format!("https://{}.s3.{}.amazonaws.com/", self.bucket, self.region),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Instantiate the configured backend.
pub async fn build_storage(cfg: &AppConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let adapter: Arc<dyn StorageAdapter> = match &cfg.storage {
        StorageConfig::Local { upload_dir } => {
            Arc::new(LocalStorageAdapter::new(upload_dir.clone(), &cfg.app_url).await?)
        }
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => Arc::new(
            S3StorageAdapter::new(
                bucket.clone(),
                region.clone(),
                endpoint.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
            )
            .await,
        ),
    };
    tracing::info!(backend = adapter.backend_name(), "storage adapter ready");
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_adapter() -> LocalStorageAdapter {
        let dir = std::env::temp_dir().join(format!("blog-tenancy-storage-{}", Uuid::new_v4()));
        LocalStorageAdapter::new(dir, "http://localhost:3000/")
            .await
            .unwrap()
    }

    #[test]
    fn extension_comes_from_mime_subtype() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpeg");
        assert_eq!(extension_for("image/svg+xml"), "svg");
        assert_eq!(extension_for("text/plain; charset=utf-8"), "plain");
        assert_eq!(extension_for("garbage"), "bin");
        assert_eq!(extension_for("image/../../etc"), "bin");
    }

    #[test]
    fn generated_keys_are_namespaced_and_unique() {
        let a = generate_key("tenants/blog-1/", "image/png");
        let b = generate_key("tenants/blog-1", "image/png");
        assert!(a.starts_with("tenants/blog-1/"));
        assert!(a.ends_with(".png"));
        assert_ne!(a, b);
    }

    #[test]
    fn deletable_key_requires_tenant_namespace() {
        let prefix = "http://localhost:3000/uploads/";
        assert_eq!(deletable_key("random/unrelated/key", prefix), None);
        assert_eq!(deletable_key("tenants/../secrets", prefix), None);
        assert_eq!(
            deletable_key("https://cdn.evil.com/tenants/a/x.png", prefix),
            None
        );
        assert_eq!(
            deletable_key("http://localhost:3000/uploads/tenants/a/x.png", prefix).as_deref(),
            Some("tenants/a/x.png")
        );
        assert_eq!(
            deletable_key("tenants/a/x.png", prefix).as_deref(),
            Some("tenants/a/x.png")
        );
    }

    #[tokio::test]
    async fn local_upload_never_uses_caller_filename() {
        let adapter = local_adapter().await;
        let stored = adapter
            .upload(Bytes::from_static(b"\x89PNG...."), "image/png", "tenants/blog-1")
            .await
            .unwrap();

        assert!(stored.key.starts_with("tenants/blog-1/"));
        assert_ne!(stored.key, "tenants/blog-1/avatar.png");
        assert_eq!(
            stored.public_url,
            format!("http://localhost:3000/uploads/{}", stored.key)
        );
        let on_disk = fs::read(adapter.path_for(&stored.key).unwrap()).await.unwrap();
        assert_eq!(on_disk, b"\x89PNG....");
    }

    #[tokio::test]
    async fn local_delete_ignores_foreign_keys_and_removes_own() {
        let adapter = local_adapter().await;
        let stored = adapter
            .upload(Bytes::from_static(b"GIF89a"), "image/gif", "tenants/blog-2")
            .await
            .unwrap();

        // Unrelated file at the root must survive a delete outside the namespace.
        let unrelated = adapter.upload_dir().join("random/unrelated/key");
        fs::create_dir_all(unrelated.parent().unwrap()).await.unwrap();
        fs::write(&unrelated, b"keep").await.unwrap();
        adapter.delete("random/unrelated/key").await.unwrap();
        assert!(fs::metadata(&unrelated).await.is_ok());

        adapter.delete(&stored.public_url).await.unwrap();
        assert!(fs::metadata(adapter.path_for(&stored.key).unwrap()).await.is_err());

        // Deleting again is fine.
        adapter.delete(&stored.key).await.unwrap();
    }

    #[tokio::test]
    async fn local_adapter_cannot_presign() {
        let adapter = local_adapter().await;
        let err = adapter
            .presign("image/png", 10, "tenants/blog-1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }
}
