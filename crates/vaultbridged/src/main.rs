//! vaultbridged: host/enclave data plane daemon.
//!
//! ```text
//! vaultbridged host [REQUEST_ID DATA_STORE_ID PREFIX]
//! vaultbridged enclave
//! ```

use anyhow::{bail, Result};

use vaultbridge_core::config::VaultbridgeConfig;

mod enclave;
mod host;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = VaultbridgeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VaultbridgeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VaultbridgeConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let role = args.first().map(String::as_str).unwrap_or("");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match role {
        "host" => {
            let job = match &args[1..] {
                [] => None,
                [request_id, data_store_id, prefix] => Some(host::DownloadJob {
                    request_id: request_id.clone(),
                    data_store_id: data_store_id.clone(),
                    prefix: prefix.clone(),
                }),
                _ => bail!("usage: vaultbridged host [REQUEST_ID DATA_STORE_ID PREFIX]"),
            };
            tracing::info!(listen = %config.host.listen, enclave = %config.enclave.connect, "vaultbridged starting in host role");
            host::run(config, job, shutdown_tx).await
        }
        "enclave" => {
            tracing::info!(listen = %config.enclave.listen, host = %config.enclave.host_connect, "vaultbridged starting in enclave role");
            enclave::run(config, shutdown_tx).await
        }
        _ => bail!("usage: vaultbridged <host|enclave> [...]"),
    }
}
