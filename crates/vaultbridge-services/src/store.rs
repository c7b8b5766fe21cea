//! Remote object store access.
//!
//! [`RemoteStore`] is the seam the data plane talks to: listing, streaming
//! reads, and the four multipart upload calls. [`ObjectStoreBackend`] maps
//! bucket names onto `object_store` instances (S3 in production,
//! `InMemory` in tests).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown bucket {0:?}")]
    UnknownBucket(String),
    #[error("unknown data store {0:?}")]
    UnknownDataStore(String),
    #[error("invalid part: {0}")]
    InvalidPart(String),
    #[error(transparent)]
    Backend(#[from] object_store::Error),
}

/// A remote object body, read incrementally.
pub struct ObjectStream {
    /// Length reported by the store.
    pub length: u64,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// An open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A part acknowledged by the store. Part numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub part_id: String,
}

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Keys under `prefix` in `bucket`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn get_object_stream(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError>;

    async fn start_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<UploadTarget, StoreError>;

    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart, StoreError>;

    /// `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        target: &UploadTarget,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError>;

    async fn abort_multipart_upload(&self, target: &UploadTarget) -> Result<(), StoreError>;
}

/// Object stores that also support explicit multipart uploads.
pub trait MultipartObjectStore: ObjectStore + MultipartStore {}

impl<T: ObjectStore + MultipartStore> MultipartObjectStore for T {}

/// [`RemoteStore`] over `object_store` backends, one per bucket.
#[derive(Default, Clone)]
pub struct ObjectStoreBackend {
    buckets: HashMap<String, Arc<dyn MultipartObjectStore>>,
}

impl ObjectStoreBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(
        mut self,
        bucket: impl Into<String>,
        store: Arc<dyn MultipartObjectStore>,
    ) -> Self {
        self.buckets.insert(bucket.into(), store);
        self
    }

    fn bucket(&self, bucket: &str) -> Result<&Arc<dyn MultipartObjectStore>, StoreError> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| StoreError::UnknownBucket(bucket.to_string()))
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreBackend {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let store = self.bucket(bucket)?;
        let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let mut keys: Vec<String> = store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }

    async fn get_object_stream(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError> {
        let store = self.bucket(bucket)?;
        let result = store.get(&ObjectPath::from(key)).await?;
        let length = result.meta.size as u64;
        let body = result.into_stream().map_err(io::Error::other).boxed();
        Ok(ObjectStream { length, body })
    }

    async fn start_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<UploadTarget, StoreError> {
        let store = self.bucket(bucket)?;
        let upload_id = store.create_multipart(&ObjectPath::from(key)).await?;
        tracing::debug!(bucket, key, %upload_id, "multipart upload started");
        Ok(UploadTarget {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        if part_number == 0 {
            return Err(StoreError::InvalidPart("part numbers start at 1".into()));
        }
        let store = self.bucket(&target.bucket)?;
        let part = store
            .put_part(
                &ObjectPath::from(target.key.as_str()),
                &target.upload_id,
                (part_number - 1) as usize,
                PutPayload::from_bytes(data),
            )
            .await?;
        Ok(CompletedPart {
            part_number,
            part_id: part.content_id,
        })
    }

    async fn complete_multipart_upload(
        &self,
        target: &UploadTarget,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError> {
        for (expected, part) in (1u32..).zip(&parts) {
            if part.part_number != expected {
                return Err(StoreError::InvalidPart(format!(
                    "expected part {expected}, found {}",
                    part.part_number
                )));
            }
        }
        let store = self.bucket(&target.bucket)?;
        let parts = parts
            .into_iter()
            .map(|p| PartId {
                content_id: p.part_id,
            })
            .collect();
        store
            .complete_multipart(
                &ObjectPath::from(target.key.as_str()),
                &target.upload_id,
                parts,
            )
            .await?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, target: &UploadTarget) -> Result<(), StoreError> {
        let store = self.bucket(&target.bucket)?;
        store
            .abort_multipart(&ObjectPath::from(target.key.as_str()), &target.upload_id)
            .await?;
        Ok(())
    }
}
