//! Host role: streams inputs into the enclave and uploads results.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use vaultbridge_core::config::VaultbridgeConfig;
use vaultbridge_services::{
    Event, EventBus, Listener, ObjectStoreDownloader, RemoteStore, RequestRouter,
    ResultChunkReceiver, ResultUploadManager, Topic, TransportServer,
};

/// A one-shot download requested on the command line.
pub struct DownloadJob {
    pub request_id: String,
    pub data_store_id: String,
    pub prefix: String,
}

pub async fn run(
    config: VaultbridgeConfig,
    job: Option<DownloadJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let bus = EventBus::new();
    let store: Arc<dyn RemoteStore> = Arc::new(crate::store::build(&config)?);

    bus.subscribe(Topic::WorkloadCompleted, |_event: Event| {
        tracing::info!("workload completed");
    });

    let uploads = ResultUploadManager::new(
        Arc::clone(&store),
        bus.clone(),
        &config.upload,
        &config.data_stores,
    );
    uploads.attach();
    let upload_task = tokio::spawn(Arc::clone(&uploads).run(shutdown_tx.subscribe()));

    let router = RequestRouter::new(
        config.enclave.connect,
        &config.transport,
        &config.router,
        bus.clone(),
    );
    router.attach();
    let drain_task = tokio::spawn(Arc::clone(&router).run_drain_loop(shutdown_tx.subscribe()));

    let listener = Listener::bind(&config.host.listen).await?;
    let server = TransportServer::new(
        Arc::new(ResultChunkReceiver::new(bus.clone(), &config.transport)),
        &config.transport,
    );
    let server_shutdown = shutdown_tx.subscribe();
    let server_task =
        tokio::spawn(async move { server.accept_loop(listener, server_shutdown).await });

    if let Some(job) = job {
        let bucket = config
            .find_data_store(&job.data_store_id)
            .map(|ds| ds.bucket.clone())
            .with_context(|| format!("unknown data store {:?}", job.data_store_id))?;
        let downloader = ObjectStoreDownloader::from_names(
            Arc::clone(&store),
            bus.clone(),
            &config.downloader.content_kinds,
        );
        tokio::spawn(async move {
            match downloader
                .stream_prefix(&job.request_id, &job.data_store_id, &bucket, &job.prefix)
                .await
            {
                Ok(summary) => tracing::info!(
                    request_id = %job.request_id,
                    published = summary.published,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "download finished"
                ),
                Err(e) => {
                    tracing::error!(request_id = %job.request_id, error = %e, "download failed")
                }
            }
        });
    }

    server_task.await.context("transport server task panicked")??;
    upload_task.await.context("upload task panicked")?;
    drain_task.await.context("drain task panicked")?;
    tracing::info!(pending = router.pending(), tracked = uploads.tracked(), "host stopped");
    Ok(())
}
