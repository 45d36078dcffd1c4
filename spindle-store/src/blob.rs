use crate::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;

/// A stored object: body plus the custom metadata headers the cache and
/// result pipelines hang off it.
#[derive(Debug, Clone)]
pub struct BlobObject {
    pub body: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

impl BlobObject {
    pub fn new(body: impl Into<Bytes>, content_type: &str) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Bucketed object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, object: BlobObject) -> Result<(), StoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, StoreError>;

    /// Metadata only, without transferring the body.
    async fn head(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Remove every object in a bucket.
    async fn clear_bucket(&self, bucket: &str) -> Result<(), StoreError>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, BlobObject>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, object: BlobObject) -> Result<(), StoreError> {
        self.objects.insert(Self::object_key(bucket, key), object);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, StoreError> {
        Ok(self
            .objects
            .get(&Self::object_key(bucket, key))
            .map(|o| o.value().clone()))
    }

    async fn head(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        Ok(self
            .objects
            .get(&Self::object_key(bucket, key))
            .map(|o| o.value().metadata.clone()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.objects.remove(&Self::object_key(bucket, key));
        Ok(())
    }

    async fn clear_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let prefix = format!("{}/", bucket);
        self.objects.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = MemoryBlobStore::new();
        let mut meta = HashMap::new();
        meta.insert("content-sha1".to_string(), "abc".to_string());
        store
            .put(
                "cache",
                "k1",
                BlobObject::new("hello", "text/plain").with_metadata(meta),
            )
            .await
            .unwrap();

        let obj = store.get("cache", "k1").await.unwrap().unwrap();
        assert_eq!(&obj.body[..], b"hello");
        assert_eq!(obj.content_type, "text/plain");
        assert_eq!(obj.metadata["content-sha1"], "abc");
    }

    #[tokio::test]
    async fn test_head_returns_metadata_only() {
        let store = MemoryBlobStore::new();
        let mut meta = HashMap::new();
        meta.insert("cache-etag".to_string(), "\"e1\"".to_string());
        store
            .put(
                "cache",
                "k1",
                BlobObject::new("body", "text/plain").with_metadata(meta),
            )
            .await
            .unwrap();

        let head = store.head("cache", "k1").await.unwrap().unwrap();
        assert_eq!(head["cache-etag"], "\"e1\"");
        assert!(store.head("cache", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let store = MemoryBlobStore::new();
        store
            .put("results", "u1", BlobObject::new("x", "text/plain"))
            .await
            .unwrap();
        store.delete("results", "u1").await.unwrap();
        assert!(store.get("results", "u1").await.unwrap().is_none());
        // Deleting a missing key is not an error.
        store.delete("results", "u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_bucket_is_scoped() {
        let store = MemoryBlobStore::new();
        store
            .put("cache", "a", BlobObject::new("1", "text/plain"))
            .await
            .unwrap();
        store
            .put("cache", "b", BlobObject::new("2", "text/plain"))
            .await
            .unwrap();
        store
            .put("results", "c", BlobObject::new("3", "text/plain"))
            .await
            .unwrap();

        store.clear_bucket("cache").await.unwrap();
        assert!(store.get("cache", "a").await.unwrap().is_none());
        assert!(store.get("cache", "b").await.unwrap().is_none());
        assert!(store.get("results", "c").await.unwrap().is_some());
    }
}
