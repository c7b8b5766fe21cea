use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use vaultbridge_core::config::{DataStoreConfig, VaultbridgeConfig};
use vaultbridge_core::endpoint::Endpoint;
use vaultbridge_services::{
    DecryptCommand, DecryptingReceiver, DecryptionPipeline, DownloadSummary, Event, EventBus,
    KeyRing, Listener, ObjectStoreBackend, ObjectStoreDownloader, RemoteStore, RequestRouter,
    ResultChunkReceiver, ResultPublisher, ResultUploadManager, Topic, TransportServer,
};

pub const INPUT_STORE: &str = "inputs";
pub const INPUT_BUCKET: &str = "input-bucket";
pub const RESULT_STORE: &str = "results";
pub const RESULT_BUCKET: &str = "result-bucket";

/// Whether the stand-in decrypt program can run here.
pub fn have_sh() -> bool {
    Path::new("/bin/sh").exists()
}

/// Upper-cases its input. The key is passed as `$1` and ignored.
pub fn upcase_command() -> DecryptCommand {
    DecryptCommand::new("sh", ["-c", "tr a-z A-Z", "sh", "{key}"].map(String::from))
}

/// Reads its input, complains, and exits non-zero.
pub fn failing_command() -> DecryptCommand {
    DecryptCommand::new(
        "sh",
        ["-c", "cat >/dev/null; echo bad key >&2; exit 3", "sh", "{key}"].map(String::from),
    )
}

/// Small chunks and short intervals so tests exercise rechunking quickly.
pub fn test_config() -> VaultbridgeConfig {
    let mut config = VaultbridgeConfig::default();
    config.transport.chunk_size = 16;
    config.transport.connect_timeout_secs = 5;
    config.transport.io_timeout_secs = 10;
    config.transport.accept_retry_ms = 10;
    config.upload.chunks_per_part = 2;
    config.upload.poll_interval_ms = 20;
    config.router.drain_interval_ms = 20;
    config.enclave.forward_decrypted = true;
    config.enclave.result_data_store_id = RESULT_STORE.to_string();
    config.data_stores = vec![
        DataStoreConfig { id: INPUT_STORE.to_string(), bucket: INPUT_BUCKET.to_string() },
        DataStoreConfig { id: RESULT_STORE.to_string(), bucket: RESULT_BUCKET.to_string() },
    ];
    config
}

pub struct BridgeOptions {
    pub decrypt: DecryptCommand,
    /// `(data_store_id, key)` pairs loaded into the enclave key ring.
    pub keys: Vec<(String, String)>,
    /// Point the host at this endpoint instead of the enclave listener.
    pub enclave_override: Option<Endpoint>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            decrypt: upcase_command(),
            keys: vec![(INPUT_STORE.to_string(), "secret".to_string())],
            enclave_override: None,
        }
    }
}

/// Both sides of the bridge wired up and running.
pub struct Bridge {
    pub config: VaultbridgeConfig,
    pub host_bus: EventBus,
    pub enclave_bus: EventBus,
    pub inputs: Arc<InMemory>,
    pub results: Arc<InMemory>,
    pub store: Arc<dyn RemoteStore>,
    pub pipeline: Arc<DecryptionPipeline>,
    pub uploads: Arc<ResultUploadManager>,
    pub scratch: tempfile::TempDir,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub async fn start(options: BridgeOptions) -> Result<Self> {
        let mut config = test_config();
        let scratch = tempfile::tempdir()?;
        config.decryption.scratch_dir = scratch.path().join("scratch");

        let loopback: Endpoint = "tcp://127.0.0.1:0".parse()?;
        let host_listener = Listener::bind(&loopback).await?;
        let enclave_listener = Listener::bind(&loopback).await?;
        config.host.listen = host_listener.local_endpoint()?;
        config.enclave.listen = enclave_listener.local_endpoint()?;
        config.enclave.connect = options.enclave_override.unwrap_or(config.enclave.listen);
        config.enclave.host_connect = config.host.listen;

        let (shutdown, _) = broadcast::channel::<()>(1);
        let mut tasks = Vec::new();

        // ── Host side ────────────────────────────────────────────────────────
        let inputs = Arc::new(InMemory::new());
        let results = Arc::new(InMemory::new());
        let store: Arc<dyn RemoteStore> = Arc::new(
            ObjectStoreBackend::new()
                .with_bucket(INPUT_BUCKET, inputs.clone())
                .with_bucket(RESULT_BUCKET, results.clone()),
        );
        let host_bus = EventBus::new();

        let uploads = ResultUploadManager::new(
            Arc::clone(&store),
            host_bus.clone(),
            &config.upload,
            &config.data_stores,
        );
        uploads.attach();
        tasks.push(tokio::spawn(Arc::clone(&uploads).run(shutdown.subscribe())));

        let host_router = RequestRouter::new(
            config.enclave.connect,
            &config.transport,
            &config.router,
            host_bus.clone(),
        );
        host_router.attach();
        tasks.push(tokio::spawn(host_router.run_drain_loop(shutdown.subscribe())));

        let host_server = TransportServer::new(
            Arc::new(ResultChunkReceiver::new(host_bus.clone(), &config.transport)),
            &config.transport,
        );
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let _ = host_server.accept_loop(host_listener, rx).await;
        }));

        // ── Enclave side ─────────────────────────────────────────────────────
        let enclave_bus = EventBus::new();
        let keys = KeyRing::new();
        for (data_store_id, key) in &options.keys {
            keys.insert(data_store_id.clone(), key);
        }
        let pipeline = Arc::new(DecryptionPipeline::new(
            options.decrypt,
            config.decryption.scratch_dir.clone(),
            enclave_bus.clone(),
            keys,
        ));

        let enclave_router = RequestRouter::new(
            config.enclave.host_connect,
            &config.transport,
            &config.router,
            enclave_bus.clone(),
        );
        enclave_router.attach();
        tasks.push(tokio::spawn(enclave_router.run_drain_loop(shutdown.subscribe())));

        ResultPublisher::new(enclave_bus.clone())
            .forward_decrypted(config.enclave.result_data_store_id.clone());

        let enclave_server = TransportServer::new(
            Arc::new(DecryptingReceiver::new(Arc::clone(&pipeline), &config.transport)),
            &config.transport,
        );
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let _ = enclave_server.accept_loop(enclave_listener, rx).await;
        }));

        Ok(Self {
            config,
            host_bus,
            enclave_bus,
            inputs,
            results,
            store,
            pipeline,
            uploads,
            scratch,
            shutdown,
            tasks,
        })
    }

    /// Place an input object in the input bucket.
    pub async fn put_input(&self, key: &str, body: &[u8]) -> Result<()> {
        self.inputs
            .put(&key.into(), PutPayload::from(Bytes::copy_from_slice(body)))
            .await?;
        Ok(())
    }

    /// Stream every object under `prefix` into the enclave.
    pub async fn download(&self, request_id: &str, prefix: &str) -> Result<DownloadSummary> {
        let downloader = ObjectStoreDownloader::from_names(
            Arc::clone(&self.store),
            self.host_bus.clone(),
            &["parquet".to_string(), "csv".to_string()],
        );
        Ok(downloader
            .stream_prefix(request_id, INPUT_STORE, INPUT_BUCKET, prefix)
            .await?)
    }

    /// Read a finished result object.
    pub async fn result(&self, key: &str) -> Result<Bytes> {
        Ok(self.results.get(&key.into()).await?.bytes().await?)
    }

    /// Keys currently present in the result bucket.
    pub async fn result_keys(&self) -> Result<Vec<String>> {
        Ok(self.store.list_objects(RESULT_BUCKET, "").await?)
    }

    /// Poll until every key in `keys` exists in the result bucket.
    pub async fn wait_for_results(&self, keys: &[&str], secs: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        loop {
            let present = self.result_keys().await?;
            if keys.iter().all(|k| present.iter().any(|p| p == k)) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("timed out waiting for {keys:?}, have {present:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Files left behind in the enclave scratch directory.
    pub fn scratch_files(&self) -> usize {
        std::fs::read_dir(&self.config.decryption.scratch_dir)
            .map(|dir| dir.count())
            .unwrap_or(0)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.pipeline.shutdown().await;
    }
}

/// Forward every event on `topic` into a channel.
pub fn watch(bus: &EventBus, topic: Topic) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(topic, move |event| {
        let _ = tx.send(event);
    });
    rx
}

/// Wait up to `secs` for the next event on a watched topic.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>, secs: u64) -> Result<Event> {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .context("timed out waiting for event")?
        .context("event channel closed")
}
