//! Enclave role: decrypts inbound objects and ships results to the host.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use vaultbridge_core::config::VaultbridgeConfig;
use vaultbridge_services::{
    DecryptingReceiver, DecryptionPipeline, EventBus, KeyRing, Listener, RequestRouter,
    ResultPublisher, TransportServer,
};

pub async fn run(config: VaultbridgeConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let bus = EventBus::new();

    let keys = KeyRing::new();
    match &config.decryption.key_file {
        Some(path) => {
            let loaded = keys.load_json_file(path)?;
            tracing::info!(keys = loaded, "data keys loaded");
        }
        None => tracing::warn!("no key file configured, every object will be refused"),
    }

    let pipeline = Arc::new(DecryptionPipeline::from_settings(
        &config.decryption,
        bus.clone(),
        keys,
    ));

    let router = RequestRouter::new(
        config.enclave.host_connect,
        &config.transport,
        &config.router,
        bus.clone(),
    );
    router.attach();
    let drain_task = tokio::spawn(Arc::clone(&router).run_drain_loop(shutdown_tx.subscribe()));

    if config.enclave.forward_decrypted {
        tracing::info!(
            data_store_id = %config.enclave.result_data_store_id,
            "forwarding decrypted files as results"
        );
        ResultPublisher::new(bus.clone())
            .forward_decrypted(config.enclave.result_data_store_id.clone());
    }

    let listener = Listener::bind(&config.enclave.listen).await?;
    let server = TransportServer::new(
        Arc::new(DecryptingReceiver::new(Arc::clone(&pipeline), &config.transport)),
        &config.transport,
    );
    server.accept_loop(listener, shutdown_tx.subscribe()).await?;

    pipeline.shutdown().await;
    drain_task.await.context("drain task panicked")?;
    tracing::info!(pending = router.pending(), "enclave stopped");
    Ok(())
}
