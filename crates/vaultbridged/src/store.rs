//! Remote store construction for the host role.

use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;

use vaultbridge_core::config::VaultbridgeConfig;
use vaultbridge_services::ObjectStoreBackend;

/// One S3 client per configured data store bucket. Credentials come from
/// the standard AWS environment variables.
pub fn build(config: &VaultbridgeConfig) -> Result<ObjectStoreBackend> {
    let mut backend = ObjectStoreBackend::new();
    for data_store in &config.data_stores {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(&config.store.region)
            .with_bucket_name(&data_store.bucket);
        if !config.store.endpoint.is_empty() {
            builder = builder
                .with_endpoint(&config.store.endpoint)
                .with_allow_http(config.store.endpoint.starts_with("http://"));
        }
        let s3 = builder
            .build()
            .with_context(|| format!("failed to configure bucket {}", data_store.bucket))?;
        tracing::debug!(data_store_id = %data_store.id, bucket = %data_store.bucket, "store configured");
        backend = backend.with_bucket(data_store.bucket.clone(), Arc::new(s3));
    }
    Ok(backend)
}
