//! Per-connection receive routines for both sides of the bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;

use vaultbridge_core::config::TransportSettings;
use vaultbridge_core::{MessageKind, MessageMetadata, TransportMessage};

use super::server::ConnectionHandler;
use super::{read_chunk, timed, Connection};
use crate::decryption::DecryptionPipeline;
use crate::event_bus::EventBus;
use crate::events::Event;

/// Enclave side: streams encrypted objects into the decryption pipeline.
pub struct DecryptingReceiver {
    pipeline: Arc<DecryptionPipeline>,
    chunk_size: usize,
    io_timeout: Duration,
}

impl DecryptingReceiver {
    pub fn new(pipeline: Arc<DecryptionPipeline>, settings: &TransportSettings) -> Self {
        Self {
            pipeline,
            chunk_size: settings.chunk_size,
            io_timeout: settings.io_timeout(),
        }
    }

    async fn pump(&self, metadata: &MessageMetadata, conn: &mut dyn Connection) -> Result<u64> {
        let mut received = 0u64;
        loop {
            let chunk = timed(self.io_timeout, "read", read_chunk(&mut *conn, self.chunk_size)).await?;
            received += chunk.len() as u64;
            let end = chunk.is_empty();
            self.pipeline.decrypt_chunk(metadata, &chunk).await?;
            if end {
                return Ok(received);
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for DecryptingReceiver {
    async fn handle(&self, metadata: MessageMetadata, conn: &mut dyn Connection) -> Result<()> {
        if metadata.kind != MessageKind::ObjectStream {
            bail!("unexpected {:?} message on the enclave listener", metadata.kind);
        }
        if !self.pipeline.has_key(&metadata.data_store_id) {
            bail!("no data key for data store {:?}", metadata.data_store_id);
        }

        let result = self.pump(&metadata, conn).await;
        // No-op after a clean finish; discards a half-fed session otherwise.
        self.pipeline.close_session(&metadata).await;

        let received = result?;
        tracing::info!(
            request_id = %metadata.request_id,
            remote_key = %metadata.remote_key,
            bytes = received,
            "object received"
        );
        Ok(())
    }
}

/// Host side: republishes result bytes as `DataStorePartAvailable` events.
///
/// Every full chunk becomes one event. At the end of the payload a short
/// residual chunk, if any, becomes one more event, and a completion message
/// is followed by an empty-payload event marking the end of the result.
pub struct ResultChunkReceiver {
    bus: EventBus,
    chunk_size: usize,
    io_timeout: Duration,
}

impl ResultChunkReceiver {
    pub fn new(bus: EventBus, settings: &TransportSettings) -> Self {
        Self {
            bus,
            chunk_size: settings.chunk_size,
            io_timeout: settings.io_timeout(),
        }
    }

    fn publish(&self, metadata: &MessageMetadata, payload: Bytes) {
        self.bus.publish(Event::DataStorePartAvailable(TransportMessage::new(
            metadata.clone(),
            payload,
        )));
    }
}

#[async_trait]
impl ConnectionHandler for ResultChunkReceiver {
    async fn handle(&self, metadata: MessageMetadata, conn: &mut dyn Connection) -> Result<()> {
        if !matches!(
            metadata.kind,
            MessageKind::DataStorePart | MessageKind::MultipartComplete
        ) {
            bail!("unexpected {:?} message on the host listener", metadata.kind);
        }

        let mut chunks = 0usize;
        let mut received = 0u64;
        loop {
            let chunk = timed(self.io_timeout, "read", read_chunk(&mut *conn, self.chunk_size)).await?;
            if chunk.is_empty() {
                break;
            }
            let full = chunk.len() == self.chunk_size;
            received += chunk.len() as u64;
            chunks += 1;
            self.publish(&metadata, Bytes::from(chunk));
            if !full {
                break;
            }
        }

        if metadata.is_completion() {
            self.publish(&metadata, Bytes::new());
        }
        tracing::debug!(
            request_id = %metadata.request_id,
            chunks,
            bytes = received,
            completion = metadata.is_completion(),
            "result chunks received"
        );
        Ok(())
    }
}
