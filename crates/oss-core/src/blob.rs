use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::BlobConfig;
use crate::fingerprint::sha256_hex;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("invalid content hash {0:?}")]
    InvalidHash(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("blob backend misconfigured: {0}")]
    Misconfigured(String),
}

/// Content-addressed storage for raw RFC 822 bytes and attachment payloads.
/// Hashes are lowercase hex SHA-256 of the payload, so repeated puts of the
/// same content are idempotent. The store never inspects content.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, organization_id: &str, bytes: &[u8]) -> Result<String, BlobError>;
    async fn get(&self, organization_id: &str, content_hash: &str) -> Result<Vec<u8>, BlobError>;
    /// Short-lived direct URL when the backend supports presigning; `None`
    /// means the caller must stream through an authorized endpoint instead.
    async fn signed_url(
        &self,
        organization_id: &str,
        content_hash: &str,
        ttl: Duration,
    ) -> Result<Option<String>, BlobError>;
}

pub fn blob_key(organization_id: &str, content_hash: &str) -> String {
    format!("oss/{organization_id}/{content_hash}")
}

fn validate_hash(content_hash: &str) -> Result<(), BlobError> {
    let valid = content_hash.len() == 64
        && content_hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidHash(content_hash.to_string()))
    }
}

/// Filesystem backend: `<root>/oss/<org>/<hash>`. Writes go through a temp
/// file and rename so a crashed put never leaves a truncated blob behind.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, organization_id: &str, content_hash: &str) -> PathBuf {
        self.root.join(blob_key(organization_id, content_hash))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, organization_id: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let content_hash = sha256_hex(bytes);
        let path = self.path_for(organization_id, &content_hash);

        if tokio::fs::try_exists(&path).await? {
            return Ok(content_hash);
        }

        let parent = path
            .parent()
            .ok_or_else(|| BlobError::Backend("blob path has no parent".to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        Ok(content_hash)
    }

    async fn get(&self, organization_id: &str, content_hash: &str) -> Result<Vec<u8>, BlobError> {
        validate_hash(content_hash)?;
        let path = self.path_for(organization_id, content_hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(content_hash.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn signed_url(
        &self,
        _organization_id: &str,
        content_hash: &str,
        _ttl: Duration,
    ) -> Result<Option<String>, BlobError> {
        validate_hash(content_hash)?;
        Ok(None)
    }
}

/// S3-compatible backend. Bucket and optional custom endpoint come from the
/// blob config section; credentials resolve through the usual AWS chain.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_config(blob: &BlobConfig) -> Result<Self, BlobError> {
        let bucket = blob
            .bucket
            .clone()
            .ok_or_else(|| BlobError::Misconfigured("s3 backend requires a bucket".to_string()))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &blob.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &blob.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        Ok(Self::new(
            aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
        ))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, organization_id: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let content_hash = sha256_hex(bytes);
        let key = blob_key(organization_id, &content_hash);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|err| BlobError::Backend(err.to_string()))?;

        Ok(content_hash)
    }

    async fn get(&self, organization_id: &str, content_hash: &str) -> Result<Vec<u8>, BlobError> {
        validate_hash(content_hash)?;
        let key = blob_key(organization_id, content_hash);

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    BlobError::NotFound(content_hash.to_string())
                } else {
                    BlobError::Backend(err.to_string())
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| BlobError::Backend(err.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn signed_url(
        &self,
        organization_id: &str,
        content_hash: &str,
        ttl: Duration,
    ) -> Result<Option<String>, BlobError> {
        validate_hash(content_hash)?;
        let key = blob_key(organization_id, content_hash);

        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|err| BlobError::Backend(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|err| BlobError::Backend(err.to_string()))?;

        Ok(Some(request.uri().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (FsBlobStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        (FsBlobStore::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (store, _dir) = store();
        let hash = store.put("org1", b"raw rfc822 bytes").await.expect("put");
        assert_eq!(hash.len(), 64);

        let bytes = store.get("org1", &hash).await.expect("get");
        assert_eq!(bytes, b"raw rfc822 bytes");
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (store, dir) = store();
        let first = store.put("org1", b"same payload").await.expect("put");
        let second = store.put("org1", b"same payload").await.expect("put again");
        assert_eq!(first, second);

        let blob_dir = dir.path().join("oss").join("org1");
        let entries = std::fs::read_dir(blob_dir).expect("read dir").count();
        assert_eq!(entries, 1, "identical content should store exactly once");
    }

    #[tokio::test]
    async fn blobs_are_scoped_by_organization() {
        let (store, _dir) = store();
        let hash = store.put("org1", b"payload").await.expect("put");

        let err = store.get("org2", &hash).await.expect_err("cross-org get");
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_unknown_hash_is_not_found() {
        let (store, _dir) = store();
        let missing = "a".repeat(64);
        let err = store.get("org1", &missing).await.expect_err("missing");
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_hex_hash_is_rejected() {
        let (store, _dir) = store();
        let err = store
            .get("org1", "../../../../etc/passwd")
            .await
            .expect_err("traversal attempt");
        assert!(matches!(err, BlobError::InvalidHash(_)));
    }

    #[tokio::test]
    async fn fs_backend_has_no_signed_urls() {
        let (store, _dir) = store();
        let hash = store.put("org1", b"payload").await.expect("put");
        let url = store
            .signed_url("org1", &hash, Duration::from_secs(60))
            .await
            .expect("signed_url");
        assert!(url.is_none());
    }

    #[test]
    fn blob_keys_follow_layout() {
        assert_eq!(blob_key("org1", "abc"), "oss/org1/abc");
    }
}
