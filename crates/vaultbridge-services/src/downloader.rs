//! Host side: streams remote objects toward the enclave.
//!
//! One invocation handles its objects strictly one at a time: the next get
//! is issued only after the previous body has been consumed or dropped.
//! Run several invocations for parallelism across requests.

use std::collections::VecDeque;
use std::sync::Arc;

use vaultbridge_core::{ContentKind, MessageMetadata, ObjectDescriptor};

use crate::event_bus::EventBus;
use crate::events::{Event, ObjectBody, ObjectTransfer};
use crate::store::{RemoteStore, StoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Objects handed to a subscriber.
    pub published: usize,
    /// Objects whose content kind is not streamed.
    pub skipped: usize,
    /// Objects that could not be opened or had no subscriber.
    pub failed: usize,
}

pub struct ObjectStoreDownloader {
    store: Arc<dyn RemoteStore>,
    bus: EventBus,
    kinds: Vec<ContentKind>,
}

impl ObjectStoreDownloader {
    pub fn new(store: Arc<dyn RemoteStore>, bus: EventBus, kinds: Vec<ContentKind>) -> Self {
        Self { store, bus, kinds }
    }

    /// Build from configured kind names, ignoring names that are not
    /// recognized content kinds.
    pub fn from_names(store: Arc<dyn RemoteStore>, bus: EventBus, names: &[String]) -> Self {
        let kinds = names
            .iter()
            .filter_map(|name| {
                let kind = ContentKind::from_name(name);
                if kind.is_none() {
                    tracing::warn!(kind = %name, "ignoring unknown content kind");
                }
                kind
            })
            .collect();
        Self::new(store, bus, kinds)
    }

    /// Stream every listed object under `prefix`, in key order.
    pub async fn stream_prefix(
        &self,
        request_id: &str,
        data_store_id: &str,
        bucket: &str,
        prefix: &str,
    ) -> Result<DownloadSummary, StoreError> {
        let keys = self.store.list_objects(bucket, prefix).await?;
        tracing::info!(request_id, bucket, prefix, objects = keys.len(), "listing complete");
        let descriptors = keys
            .into_iter()
            .map(|key| ObjectDescriptor {
                bucket: bucket.to_string(),
                key,
                data_store_id: data_store_id.to_string(),
            })
            .collect();
        Ok(self.stream_objects(request_id, descriptors).await)
    }

    /// Publish an `ObjectAvailable` event per qualifying object, first in
    /// first out, waiting for each body to be released before the next get.
    pub async fn stream_objects(
        &self,
        request_id: &str,
        descriptors: Vec<ObjectDescriptor>,
    ) -> DownloadSummary {
        let mut queue: VecDeque<ObjectDescriptor> = descriptors.into();
        let mut summary = DownloadSummary::default();

        while let Some(object) = queue.pop_front() {
            let kind = ContentKind::from_key(&object.key);
            if !self.kinds.contains(&kind) {
                tracing::debug!(request_id, remote_key = %object.key, "skipping object of unrequested kind");
                summary.skipped += 1;
                continue;
            }

            let stream = match self.store.get_object_stream(&object.bucket, &object.key).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(request_id, remote_key = %object.key, error = %e, "failed to open object");
                    summary.failed += 1;
                    continue;
                }
            };

            let mut metadata =
                MessageMetadata::object_stream(request_id, &object.data_store_id, &object.key);
            metadata.content_length = Some(stream.length);
            let length = stream.length;

            let (body, released) = ObjectBody::new(stream);
            let delivered = self
                .bus
                .publish(Event::ObjectAvailable(ObjectTransfer { metadata, body: body.clone() }));
            drop(body);

            if delivered == 0 {
                tracing::warn!(request_id, remote_key = %object.key, "no subscriber for object stream");
                summary.failed += 1;
            } else {
                tracing::debug!(request_id, remote_key = %object.key, bytes = length, "object stream published");
                summary.published += 1;
            }
            // Resolves when the body is dropped, taken or not.
            let _ = released.await;
        }

        tracing::info!(
            request_id,
            published = summary.published,
            skipped = summary.skipped,
            failed = summary.failed,
            "download pass finished"
        );
        summary
    }
}
