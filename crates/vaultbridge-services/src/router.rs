//! Bridges bus events to transport connections.
//!
//! Object streams (`ObjectAvailable`) are sent on a bounded pool, one
//! connection each, with no ordering between them. Result messages
//! (`TransportSendRequest`) are queued per request id and drained one
//! message per request per pass, which keeps each request's parts in order
//! while different requests progress side by side, at most
//! `drain_concurrency` at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{Notify, Semaphore};

use vaultbridge_core::config::{RouterSettings, TransportSettings};
use vaultbridge_core::{DataStoreRequest, Endpoint};

use crate::event_bus::EventBus;
use crate::events::{Event, ObjectTransfer, SendRequest, Topic};
use crate::registry::Registry;
use crate::transport::{RequestBuffers, TransportClient};

type Queue = Mutex<VecDeque<DataStoreRequest>>;

pub struct RequestRouter {
    peer: Endpoint,
    transport: TransportSettings,
    drain_interval: Duration,
    drain_concurrency: usize,
    bus: EventBus,
    send_pool: Arc<Semaphore>,
    queues: Registry<String, Queue>,
    failed: Registry<String, ()>,
    buffers: RequestBuffers,
    wake: Notify,
}

impl RequestRouter {
    pub fn new(
        peer: Endpoint,
        transport: &TransportSettings,
        settings: &RouterSettings,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            transport: transport.clone(),
            drain_interval: settings.drain_interval(),
            drain_concurrency: settings.drain_concurrency.max(1),
            bus,
            send_pool: Arc::new(Semaphore::new(settings.send_pool_size.max(1))),
            queues: Registry::new(),
            failed: Registry::new(),
            buffers: RequestBuffers::new(transport.chunk_size),
            wake: Notify::new(),
        })
    }

    /// Subscribe to outbound objects, result messages and workload completion.
    pub fn attach(self: &Arc<Self>) {
        let router = Arc::clone(self);
        self.bus.subscribe(Topic::ObjectAvailable, move |event| {
            if let Event::ObjectAvailable(transfer) = event {
                router.submit_object(transfer);
            }
        });

        let router = Arc::clone(self);
        self.bus.subscribe(Topic::TransportSendRequest, move |event| {
            if let Event::TransportSendRequest(request) = event {
                router.enqueue(request);
            }
        });

        let router = Arc::clone(self);
        self.bus.subscribe(Topic::WorkloadCompleted, move |_| router.retire());
    }

    /// Send an object stream on the pool. Excess submissions wait for a slot.
    pub fn submit_object(self: &Arc<Self>, transfer: ObjectTransfer) {
        let Some(taken) = transfer.body.take() else {
            tracing::debug!(remote_key = %transfer.metadata.remote_key, "object body already taken");
            return;
        };
        let router = Arc::clone(self);
        let metadata = transfer.metadata;
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&router.send_pool).acquire_owned().await else {
                return;
            };
            let result = async {
                let mut client = TransportClient::connect(&router.peer, &router.transport).await?;
                let sent = client.send_object_stream(&metadata, taken.stream).await?;
                client.close().await?;
                anyhow::Ok(sent)
            }
            .await;
            match result {
                Ok(bytes) => tracing::info!(
                    request_id = %metadata.request_id,
                    remote_key = %metadata.remote_key,
                    bytes,
                    "object sent"
                ),
                Err(e) => tracing::warn!(
                    request_id = %metadata.request_id,
                    remote_key = %metadata.remote_key,
                    error = %format!("{e:#}"),
                    "object send failed"
                ),
            }
            // Dropping `taken` here releases the downloader.
        });
    }

    /// Queue a result message behind earlier ones for the same request.
    pub fn enqueue(&self, message: SendRequest) {
        if self.failed.contains_key(&message.request_id) {
            tracing::warn!(request_id = %message.request_id, "request already failed, dropping message");
            discard_local(&message.request);
            // The completion ends the failed stream; the id may be reused after it.
            if message.request.completed {
                self.failed.remove(&message.request_id);
            }
            return;
        }
        self.queues.update_or_insert_with(
            message.request_id,
            Queue::default,
            |queue| lock(queue).push_back(message.request),
        );
        self.wake.notify_one();
    }

    /// Messages waiting across all requests.
    pub fn pending(&self) -> usize {
        self.queues
            .snapshot()
            .iter()
            .map(|(_, queue)| lock(queue).len())
            .sum()
    }

    /// Send the head message of every request queue, up to
    /// `drain_concurrency` requests at once. Returns the number of messages
    /// taken off the queues.
    pub async fn drain_pass(self: &Arc<Self>) -> usize {
        let batch: Vec<(String, DataStoreRequest)> = self
            .queues
            .snapshot()
            .into_iter()
            .filter_map(|(request_id, queue)| {
                lock(&queue).pop_front().map(|message| (request_id, message))
            })
            .collect();
        let taken = batch.len();

        futures::stream::iter(batch)
            .for_each_concurrent(self.drain_concurrency, |(request_id, message)| async move {
                match self.send_message(&request_id, &message).await {
                    Ok(()) => discard_local(&message),
                    Err(e) => self.fail_request(&request_id, &message, &e),
                }
            })
            .await;

        self.queues.retain(|_, queue| !lock(queue).is_empty());
        taken
    }

    async fn send_message(&self, request_id: &str, message: &DataStoreRequest) -> Result<()> {
        let mut client = TransportClient::connect(&self.peer, &self.transport).await?;
        if message.completed {
            client
                .send_completion(request_id, message, &self.buffers)
                .await?;
        } else {
            client
                .send_data_store_part(request_id, message, &self.buffers)
                .await?;
        }
        client.close().await?;
        tracing::debug!(
            request_id,
            remote_key = %message.remote_file_key,
            completion = message.completed,
            "result message sent"
        );
        Ok(())
    }

    /// A lost part would corrupt the result, so the rest of the request is
    /// dropped and its completion is never sent. Messages still to come are
    /// dropped until the request's completion shows up.
    fn fail_request(&self, request_id: &str, message: &DataStoreRequest, error: &anyhow::Error) {
        tracing::warn!(request_id, error = %format!("{error:#}"), "result message failed, dropping request");
        discard_local(message);
        let mut ended = message.completed;
        if let Some(queue) = self.queues.remove(request_id) {
            for dropped in lock(&queue).drain(..) {
                ended |= dropped.completed;
                discard_local(&dropped);
            }
        }
        self.buffers.take_remainder(request_id);
        if !ended {
            self.failed.insert(request_id.to_string(), ());
        }
    }

    /// Requests whose remaining messages are being dropped.
    pub fn failed_requests(&self) -> usize {
        self.failed.len()
    }

    /// Drain queues until shutdown. Passes run back to back while work is
    /// queued; otherwise the loop waits for a wakeup or `drain_interval`.
    pub async fn run_drain_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(peer = %self.peer, "request drain loop started");
        loop {
            if self.drain_pass().await > 0 {
                match shutdown.try_recv() {
                    Err(TryRecvError::Empty) | Err(TryRecvError::Lagged(_)) => continue,
                    Ok(()) | Err(TryRecvError::Closed) => break,
                }
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.drain_interval) => {}
            }
        }
        tracing::info!("request drain loop shutting down");
    }

    /// Forget finished bookkeeping once the workload is done.
    pub fn retire(&self) {
        self.failed.clear();
        self.queues.retain(|_, queue| !lock(queue).is_empty());
        tracing::info!(pending = self.pending(), "workload completed, router bookkeeping reset");
    }
}

/// Remove a part's local file once the router owns it.
fn discard_local(message: &DataStoreRequest) {
    if !message.discard_local {
        return;
    }
    let Some(path) = message.local_path.as_deref() else {
        return;
    };
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "local part file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove local part file"),
    }
}

fn lock(queue: &Queue) -> std::sync::MutexGuard<'_, VecDeque<DataStoreRequest>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
