use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tokio::sync::Mutex;

/// Durable artifact storage. Writes are keyed and overwrite in place, so
/// writing the same key twice is harmless.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `data` under `key` and returns the store's integrity token, if
    /// the store reports one.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<Option<String>, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<Option<String>, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, &data, content_type)
            .await?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(StorageError::Status(status));
        }

        let etag = response
            .headers()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("etag"))
            .map(|(_, value)| value.trim_matches('"').to_string())
            .filter(|value| !value.is_empty());

        Ok(etag)
    }
}

/// In-process object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    writes: Mutex<u64>,
}

impl MemoryObjectStore {
    pub async fn get(&self, key: &str) -> Option<(Bytes, String)> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn write_count(&self) -> u64 {
        *self.writes.lock().await
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<Option<String>, StorageError> {
        use sha2::{Digest, Sha256};

        let etag = hex::encode(&Sha256::digest(&data)[..16]);
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (data, content_type.to_string()));
        *self.writes.lock().await += 1;
        Ok(Some(etag))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage returned HTTP {0}")]
    Status(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_overwrites_in_place() {
        let store = MemoryObjectStore::default();
        let first = store
            .put("a/b.jpg", Bytes::from_static(b"one"), "image/jpeg")
            .await
            .unwrap();
        let again = store
            .put("a/b.jpg", Bytes::from_static(b"one"), "image/jpeg")
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(store.write_count().await, 2);
        let (data, content_type) = store.get("a/b.jpg").await.unwrap();
        assert_eq!(&data[..], b"one");
        assert_eq!(content_type, "image/jpeg");
    }
}
