//! Host side: multipart upload of results to the remote store.
//!
//! Each logical request gets a [`ResultWrapper`] holding its queued network
//! chunks. A polling pass aggregates `chunks_per_part` chunks into one part,
//! so the store's part-count ceiling covers objects that many times larger
//! than a single chunk. Parts upload on a bounded worker pool; once the end
//! of the stream has been seen and everything is acknowledged, the upload is
//! completed with the parts in part-number order.
//!
//! The table is reset once every upload is finished: completed, or failed
//! with its end marker seen. `WorkloadCompleted` is published only when none
//! of them failed.
//!
//! ```text
//! Idle ─chunk─▶ Processing ─end marker─▶ Completing ─all parts acked─▶ Completed
//!                    └──────────── part upload failed ─────────────▶ Failed
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, Notify, OnceCell, Semaphore};

use vaultbridge_core::config::{DataStoreConfig, UploadSettings};
use vaultbridge_core::{MessageMetadata, TransportMessage};

use crate::event_bus::EventBus;
use crate::events::{Event, Topic};
use crate::registry::Registry;
use crate::store::{CompletedPart, RemoteStore, StoreError, UploadTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Idle,
    Processing,
    Completing,
    Completed,
    Failed,
}

#[derive(Debug)]
struct UploadState {
    status: ResultStatus,
    pending: VecDeque<Bytes>,
    in_flight: usize,
    /// Next part number to hand out. Always `parts.len() + in_flight + 1`
    /// while the wrapper is healthy.
    next_part: u32,
    parts: Vec<CompletedPart>,
    /// The end marker has arrived.
    ended: bool,
}

/// Upload state of one logical request.
pub struct ResultWrapper {
    request_id: String,
    data_store_id: String,
    remote_key: String,
    session: OnceCell<UploadTarget>,
    state: Mutex<UploadState>,
}

impl ResultWrapper {
    fn new(metadata: &MessageMetadata) -> Self {
        Self {
            request_id: metadata.request_id.clone(),
            data_store_id: metadata.data_store_id.clone(),
            remote_key: metadata.remote_key.clone(),
            session: OnceCell::new(),
            state: Mutex::new(UploadState {
                status: ResultStatus::Idle,
                pending: VecDeque::new(),
                in_flight: 0,
                next_part: 1,
                parts: Vec::new(),
                ended: false,
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> ResultStatus {
        self.lock().status
    }

    pub fn pending_chunks(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn uploaded_part_counter(&self) -> u32 {
        self.lock().next_part
    }

    /// Acknowledged parts, in part-number order.
    pub fn confirmed_parts(&self) -> Vec<CompletedPart> {
        let mut parts = self.lock().parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn upload_target(&self) -> Option<&UploadTarget> {
        self.session.get()
    }

    fn lock(&self) -> MutexGuard<'_, UploadState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What one step of a pass decided for a wrapper.
enum Step {
    Upload { part_number: u32, chunks: Vec<Bytes> },
    Complete(Vec<CompletedPart>),
    Fail(String),
    Wait,
}

pub struct ResultUploadManager {
    store: Arc<dyn RemoteStore>,
    bus: EventBus,
    buckets: HashMap<String, String>,
    settings: UploadSettings,
    results: Registry<String, ResultWrapper>,
    workers: Arc<Semaphore>,
    wake: Notify,
    pass: tokio::sync::Mutex<()>,
}

impl ResultUploadManager {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        bus: EventBus,
        settings: &UploadSettings,
        data_stores: &[DataStoreConfig],
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            buckets: data_stores
                .iter()
                .map(|ds| (ds.id.clone(), ds.bucket.clone()))
                .collect(),
            settings: settings.clone(),
            results: Registry::new(),
            workers: Arc::new(Semaphore::new(settings.workers.max(1))),
            wake: Notify::new(),
            pass: tokio::sync::Mutex::new(()),
        })
    }

    /// Subscribe to inbound result chunks.
    pub fn attach(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.bus
            .subscribe(Topic::DataStorePartAvailable, move |event| {
                if let Event::DataStorePartAvailable(message) = event {
                    manager.on_chunk(message);
                }
            });
    }

    pub fn wrapper(&self, request_id: &str) -> Option<Arc<ResultWrapper>> {
        self.results.get(request_id)
    }

    pub fn status(&self, request_id: &str) -> Option<ResultStatus> {
        self.wrapper(request_id).map(|w| w.status())
    }

    pub fn tracked(&self) -> usize {
        self.results.len()
    }

    /// Queue one inbound chunk. An empty payload marks the end of the
    /// request's result.
    pub fn on_chunk(self: &Arc<Self>, message: TransportMessage) {
        let metadata = &message.metadata;
        let (wrapper, created) = self
            .results
            .get_or_insert_with(metadata.request_id.clone(), || ResultWrapper::new(metadata));

        {
            let mut state = wrapper.lock();
            match state.status {
                ResultStatus::Failed if message.is_end_of_stream() => {
                    tracing::debug!(request_id = %metadata.request_id, "end of a failed result stream");
                    state.ended = true;
                    return;
                }
                ResultStatus::Completed | ResultStatus::Failed => {
                    tracing::warn!(
                        request_id = %metadata.request_id,
                        status = ?state.status,
                        "result chunk for a finished upload, dropping"
                    );
                    return;
                }
                ResultStatus::Completing => {
                    tracing::warn!(
                        request_id = %metadata.request_id,
                        end_marker = message.is_end_of_stream(),
                        "result data after end of stream, dropping"
                    );
                    return;
                }
                ResultStatus::Idle | ResultStatus::Processing => {}
            }

            if message.is_end_of_stream() {
                state.status = ResultStatus::Completing;
                state.ended = true;
                tracing::debug!(request_id = %metadata.request_id, queued = state.pending.len(), "end of result stream");
            } else if let Some(payload) = message.payload.clone() {
                state.pending.push_back(payload);
                state.status = ResultStatus::Processing;
            }
        }

        if created {
            // Open the multipart session early so the first part does not
            // wait for it. A failure here is retried by the next pass.
            let manager = Arc::clone(self);
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move {
                if let Err(e) = manager.open_session(&wrapper).await {
                    tracing::warn!(request_id = %wrapper.request_id, error = %e, "failed to open multipart upload");
                }
            });
        }
        self.wake.notify_one();
    }

    /// Poll until shutdown, waking early whenever new work arrives.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            chunks_per_part = self.settings.chunks_per_part,
            workers = self.settings.workers,
            "result upload manager started"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("result upload manager shutting down");
                    return;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
            self.process_pass().await;
        }
    }

    /// Advance every tracked upload once. Forgets all uploads once every one
    /// of them is finished, and publishes `WorkloadCompleted` if none failed.
    pub async fn process_pass(self: &Arc<Self>) {
        let _pass = self.pass.lock().await;

        for (request_id, wrapper) in self.results.snapshot() {
            if let Err(e) = self.process_wrapper(&wrapper).await {
                tracing::warn!(request_id = %request_id, error = %e, "result upload step failed, retrying next pass");
            }
        }

        let mut failed = 0usize;
        let finished = self.results.clear_if(|results| {
            results.values().all(|w| {
                let state = w.lock();
                match state.status {
                    ResultStatus::Completed => true,
                    ResultStatus::Failed if state.ended => {
                        failed += 1;
                        true
                    }
                    _ => false,
                }
            })
        });
        if !finished {
            return;
        }
        if failed == 0 {
            tracing::info!("all result uploads completed");
            self.bus.publish(Event::WorkloadCompleted);
        } else {
            tracing::warn!(failed, "workload finished with failed result uploads, completion withheld");
        }
    }

    async fn process_wrapper(self: &Arc<Self>, wrapper: &Arc<ResultWrapper>) -> Result<(), StoreError> {
        if matches!(
            wrapper.status(),
            ResultStatus::Idle | ResultStatus::Completed | ResultStatus::Failed
        ) {
            return Ok(());
        }

        let target = match self.open_session(wrapper).await {
            Ok(target) => target,
            Err(StoreError::UnknownDataStore(id)) => {
                self.fail(wrapper, &format!("unknown data store {id:?}")).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        loop {
            match self.next_step(wrapper) {
                Step::Upload { part_number, chunks } => {
                    self.submit_part(Arc::clone(wrapper), target.clone(), part_number, chunks);
                }
                Step::Complete(parts) => {
                    let count = parts.len();
                    self.store.complete_multipart_upload(&target, parts).await?;
                    wrapper.lock().status = ResultStatus::Completed;
                    tracing::info!(
                        request_id = %wrapper.request_id,
                        remote_key = %wrapper.remote_key,
                        parts = count,
                        "result upload completed"
                    );
                    return Ok(());
                }
                Step::Fail(reason) => {
                    self.fail(wrapper, &reason).await;
                    return Ok(());
                }
                Step::Wait => return Ok(()),
            }
        }
    }

    fn next_step(&self, wrapper: &ResultWrapper) -> Step {
        let per_part = self.settings.chunks_per_part.max(1);
        let mut state = wrapper.lock();

        let take = if state.pending.len() >= per_part {
            per_part
        } else if state.status == ResultStatus::Completing && !state.pending.is_empty() {
            state.pending.len()
        } else if state.status == ResultStatus::Completing
            && state.in_flight == 0
            && state.next_part == 1
        {
            // Empty result. The store cannot complete an upload without parts.
            0
        } else if state.status == ResultStatus::Completing && state.in_flight == 0 {
            let mut parts = state.parts.clone();
            parts.sort_by_key(|p| p.part_number);
            return Step::Complete(parts);
        } else {
            return Step::Wait;
        };

        let part_number = state.next_part;
        if part_number > self.settings.max_parts {
            return Step::Fail(format!(
                "part {part_number} exceeds the store limit of {}",
                self.settings.max_parts
            ));
        }
        state.next_part += 1;
        state.in_flight += 1;
        let chunks = state.pending.drain(..take).collect();
        Step::Upload { part_number, chunks }
    }

    fn submit_part(
        self: &Arc<Self>,
        wrapper: Arc<ResultWrapper>,
        target: UploadTarget,
        part_number: u32,
        chunks: Vec<Bytes>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&manager.workers).acquire_owned().await else {
                return;
            };
            let data = concat(chunks);
            let bytes = data.len();

            match manager.store.upload_part(&target, part_number, data).await {
                Ok(part) => {
                    let mut state = wrapper.lock();
                    state.in_flight -= 1;
                    state.parts.push(part);
                    tracing::debug!(request_id = %wrapper.request_id, part_number, bytes, "part uploaded");
                }
                Err(e) => {
                    wrapper.lock().in_flight -= 1;
                    manager
                        .fail(&wrapper, &format!("part {part_number} upload failed: {e}"))
                        .await;
                }
            }
            manager.wake.notify_one();
        });
    }

    /// Mark the wrapper failed, drop its queue and abort the upload.
    async fn fail(&self, wrapper: &ResultWrapper, reason: &str) {
        {
            let mut state = wrapper.lock();
            if state.status == ResultStatus::Failed {
                return;
            }
            state.status = ResultStatus::Failed;
            state.pending.clear();
        }
        tracing::warn!(request_id = %wrapper.request_id, reason, "result upload failed");

        if let Some(target) = wrapper.session.get() {
            if let Err(e) = self.store.abort_multipart_upload(target).await {
                tracing::warn!(request_id = %wrapper.request_id, error = %e, "failed to abort multipart upload");
            }
        }
    }

    async fn open_session(&self, wrapper: &ResultWrapper) -> Result<UploadTarget, StoreError> {
        wrapper
            .session
            .get_or_try_init(|| async {
                let bucket = self
                    .buckets
                    .get(&wrapper.data_store_id)
                    .ok_or_else(|| StoreError::UnknownDataStore(wrapper.data_store_id.clone()))?;
                let target = self
                    .store
                    .start_multipart_upload(bucket, &wrapper.remote_key)
                    .await?;
                tracing::info!(
                    request_id = %wrapper.request_id,
                    bucket = %target.bucket,
                    remote_key = %target.key,
                    "multipart upload opened"
                );
                Ok(target)
            })
            .await
            .cloned()
    }
}

/// Join queued chunks into one part body. The chunks are released here.
fn concat(chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.into_iter().next().unwrap_or_default();
    }
    let mut part = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        part.extend_from_slice(&chunk);
    }
    part.freeze()
}
