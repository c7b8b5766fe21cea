//! Receiving side: accept loop and per-connection dispatch.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};

use vaultbridge_core::config::TransportSettings;
use vaultbridge_core::MessageMetadata;

use super::{read_frame, BoxConnection, Connection, Listener};

/// Handles the payload of one inbound message.
///
/// Called after the metadata frame has been read; `conn` is positioned at
/// the start of the payload. Returning closes the connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, metadata: MessageMetadata, conn: &mut dyn Connection) -> Result<()>;
}

pub struct TransportServer {
    handler: Arc<dyn ConnectionHandler>,
    settings: TransportSettings,
}

impl TransportServer {
    pub fn new(handler: Arc<dyn ConnectionHandler>, settings: &TransportSettings) -> Self {
        Self {
            handler,
            settings: settings.clone(),
        }
    }

    /// Accept connections until shutdown.
    ///
    /// At most `accept_pool_size` connections are handled at once; the rest
    /// wait for a slot after being accepted. Accept errors are retried after
    /// `accept_retry_ms`.
    pub async fn accept_loop(
        &self,
        mut listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let pool = Arc::new(Semaphore::new(self.settings.accept_pool_size.max(1)));
        if let Ok(endpoint) = listener.local_endpoint() {
            tracing::info!(%endpoint, pool = self.settings.accept_pool_size, "transport server listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("transport server shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed, retrying");
                            tokio::time::sleep(self.settings.accept_retry()).await;
                            continue;
                        }
                    };

                    let pool = Arc::clone(&pool);
                    let handler = Arc::clone(&self.handler);
                    let settings = self.settings.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = pool.acquire_owned().await else {
                            return;
                        };
                        serve_connection(handler, conn, &settings, &peer).await;
                    });
                }
            }
        }
    }
}

async fn serve_connection(
    handler: Arc<dyn ConnectionHandler>,
    mut conn: BoxConnection,
    settings: &TransportSettings,
    peer: &str,
) {
    let metadata = match tokio::time::timeout(
        settings.io_timeout(),
        read_frame(&mut conn, settings.max_frame_bytes),
    )
    .await
    {
        Ok(Ok(metadata)) => metadata,
        Ok(Err(e)) => {
            tracing::warn!(peer, error = %format!("{e:#}"), "invalid metadata frame, dropping connection");
            return;
        }
        Err(_) => {
            tracing::warn!(peer, "timed out waiting for metadata frame");
            return;
        }
    };

    tracing::debug!(
        peer,
        kind = ?metadata.kind,
        request_id = %metadata.request_id,
        remote_key = %metadata.remote_key,
        "message received"
    );

    let request_id = metadata.request_id.clone();
    if let Err(e) = handler.handle(metadata, &mut *conn).await {
        tracing::warn!(peer, request_id = %request_id, error = %format!("{e:#}"), "connection handling failed");
    }
    // Releases the sender's `close`.
    let _ = conn.shutdown().await;
}
