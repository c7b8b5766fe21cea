//! Enclave side: hands result files to the router for delivery to the host.

use std::path::Path;

use vaultbridge_core::DataStoreRequest;

use crate::event_bus::EventBus;
use crate::events::{Event, SendRequest, Topic};

/// Publishes result parts and completions as `TransportSendRequest` events.
///
/// All parts of one request id are delivered to the host in publish order,
/// and the completion must be published after the last part.
#[derive(Clone)]
pub struct ResultPublisher {
    bus: EventBus,
}

impl ResultPublisher {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Queue `local_path` as the next part of `request_id`'s result, to be
    /// stored at `remote_key` in `data_store_id`.
    pub fn publish_part(
        &self,
        request_id: &str,
        data_store_id: &str,
        remote_key: &str,
        local_path: &Path,
    ) -> usize {
        self.send(
            request_id,
            DataStoreRequest::part(data_store_id, remote_key, local_path),
        )
    }

    /// Queue the completion of `request_id`'s result.
    pub fn publish_completion(&self, request_id: &str, data_store_id: &str, remote_key: &str) -> usize {
        self.send(request_id, DataStoreRequest::completion(data_store_id, remote_key))
    }

    fn send(&self, request_id: &str, request: DataStoreRequest) -> usize {
        let delivered = self.bus.publish(Event::TransportSendRequest(SendRequest {
            request_id: request_id.to_string(),
            request,
        }));
        if delivered == 0 {
            tracing::warn!(request_id, "no router attached, result request dropped");
        }
        delivered
    }

    /// Ship every decrypted file back unchanged as a one-part result in
    /// `result_data_store_id`, under request id `"{request_id}/{remote_key}"`.
    /// The router deletes each scratch file once it has been sent.
    pub fn forward_decrypted(&self, result_data_store_id: impl Into<String>) {
        let publisher = self.clone();
        let data_store_id = result_data_store_id.into();
        self.bus.subscribe(Topic::DataStoreFileAvailable, move |event| {
            let Event::DataStoreFileAvailable(metadata) = event else {
                return;
            };
            let Some(path) = metadata.scratch_path.as_deref() else {
                tracing::warn!(request_id = %metadata.request_id, "decrypted file without a scratch path");
                return;
            };
            let request_id = format!("{}/{}", metadata.request_id, metadata.remote_key);
            tracing::debug!(request_id = %request_id, data_store_id = %data_store_id, "forwarding decrypted file");
            publisher.send(
                &request_id,
                DataStoreRequest::part(&data_store_id, &metadata.remote_key, path).discarding_local(),
            );
            publisher.publish_completion(&request_id, &data_store_id, &metadata.remote_key);
        });
    }
}
