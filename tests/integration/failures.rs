use std::time::Duration;

use vaultbridge_core::endpoint::Endpoint;

use crate::infra::*;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// The enclave refuses objects from a data store it holds no key for.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_key_produces_no_result() {
    let bridge = Bridge::start(BridgeOptions { keys: Vec::new(), ..Default::default() })
        .await
        .unwrap();
    bridge.put_input("req1/a.parquet", b"secret rows").await.unwrap();

    let summary = bridge.download("req1", "req1/").await.unwrap();
    assert_eq!(summary.published, 1);

    settle().await;
    assert!(bridge.result_keys().await.unwrap().is_empty());
    assert_eq!(bridge.pipeline.active_sessions(), 0);
    assert_eq!(bridge.scratch_files(), 0);

    bridge.stop().await;
}

/// A decrypt program that exits non-zero leaves no scratch file and no result.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_decrypt_is_cleaned_up() {
    if !have_sh() {
        eprintln!("SKIP: /bin/sh not available");
        return;
    }
    let bridge = Bridge::start(BridgeOptions { decrypt: failing_command(), ..Default::default() })
        .await
        .unwrap();
    bridge.put_input("req1/a.parquet", &[b'x'; 64]).await.unwrap();

    bridge.download("req1", "req1/").await.unwrap();

    settle().await;
    assert_eq!(bridge.pipeline.active_sessions(), 0);
    assert_eq!(bridge.scratch_files(), 0);
    assert!(bridge.result_keys().await.unwrap().is_empty());
    assert_eq!(bridge.uploads.tracked(), 0);

    bridge.stop().await;
}

/// Sends to an unreachable enclave fail without stalling the downloader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_enclave_does_not_stall_downloads() {
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        Endpoint::Tcp(listener.local_addr().unwrap())
    };
    let bridge = Bridge::start(BridgeOptions { enclave_override: Some(closed), ..Default::default() })
        .await
        .unwrap();
    bridge.put_input("req1/a.parquet", b"one").await.unwrap();
    bridge.put_input("req1/b.parquet", b"two").await.unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(15), bridge.download("req1", "req1/"))
        .await
        .expect("downloader stalled")
        .unwrap();
    assert_eq!(summary.published, 2);
    assert!(bridge.result_keys().await.unwrap().is_empty());

    bridge.stop().await;
}
