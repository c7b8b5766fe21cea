use vaultbridge_services::{Event, ResultStatus, Topic};

use crate::infra::*;

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// One encrypted object goes host → enclave, is decrypted, and comes back
/// as a multipart result.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_object_round_trips_through_enclave() {
    if !have_sh() {
        eprintln!("SKIP: /bin/sh not available");
        return;
    }
    let bridge = Bridge::start(BridgeOptions::default()).await.unwrap();
    let mut completed = watch(&bridge.host_bus, Topic::WorkloadCompleted);

    let body = sample(100);
    bridge.put_input("req1/a.parquet", &body).await.unwrap();
    bridge.put_input("req1/notes.txt", b"not streamed").await.unwrap();

    let summary = bridge.download("req1", "req1/").await.unwrap();
    assert_eq!(summary.published, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);

    let event = next_event(&mut completed, 15).await.unwrap();
    assert!(matches!(event, Event::WorkloadCompleted));

    let result = bridge.result("req1/a.parquet").await.unwrap();
    assert_eq!(result.as_ref(), body.to_ascii_uppercase().as_slice());
    assert_eq!(bridge.result_keys().await.unwrap(), vec!["req1/a.parquet".to_string()]);
    assert_eq!(bridge.pipeline.active_sessions(), 0);
    assert_eq!(bridge.scratch_files(), 0, "decrypted file removed once sent");

    bridge.stop().await;
}

/// Objects in one download are decrypted and uploaded independently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_several_objects_each_get_a_result() {
    if !have_sh() {
        eprintln!("SKIP: /bin/sh not available");
        return;
    }
    let bridge = Bridge::start(BridgeOptions::default()).await.unwrap();

    let a = sample(40);
    let b = sample(7);
    bridge.put_input("req2/a.parquet", &a).await.unwrap();
    bridge.put_input("req2/b.csv", &b).await.unwrap();

    let summary = bridge.download("req2", "req2/").await.unwrap();
    assert_eq!(summary.published, 2);

    bridge
        .wait_for_results(&["req2/a.parquet", "req2/b.csv"], 15)
        .await
        .unwrap();
    assert_eq!(
        bridge.result("req2/a.parquet").await.unwrap().as_ref(),
        a.to_ascii_uppercase().as_slice()
    );
    assert_eq!(
        bridge.result("req2/b.csv").await.unwrap().as_ref(),
        b.to_ascii_uppercase().as_slice()
    );
    assert_eq!(bridge.scratch_files(), 0);

    // Results are tracked per decrypted object.
    for request_id in ["req2/req2/a.parquet", "req2/req2/b.csv"] {
        let status = bridge.uploads.status(request_id);
        assert!(
            matches!(status, None | Some(ResultStatus::Completed)),
            "{request_id}: {status:?}"
        );
    }

    bridge.stop().await;
}

/// An object that fits in one transport chunk still produces one part.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_object_single_part() {
    if !have_sh() {
        eprintln!("SKIP: /bin/sh not available");
        return;
    }
    let bridge = Bridge::start(BridgeOptions::default()).await.unwrap();
    let mut completed = watch(&bridge.host_bus, Topic::WorkloadCompleted);

    bridge.put_input("req3/tiny.parquet", b"abc").await.unwrap();
    bridge.download("req3", "req3/").await.unwrap();

    next_event(&mut completed, 15).await.unwrap();
    assert_eq!(bridge.result("req3/tiny.parquet").await.unwrap().as_ref(), b"ABC");

    bridge.stop().await;
}

/// An empty input still produces an (empty) result object.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_object_yields_empty_result() {
    if !have_sh() {
        eprintln!("SKIP: /bin/sh not available");
        return;
    }
    let bridge = Bridge::start(BridgeOptions::default()).await.unwrap();
    let mut completed = watch(&bridge.host_bus, Topic::WorkloadCompleted);

    bridge.put_input("req4/empty.parquet", b"").await.unwrap();
    bridge.download("req4", "req4/").await.unwrap();

    next_event(&mut completed, 15).await.unwrap();
    assert!(bridge.result("req4/empty.parquet").await.unwrap().is_empty());
    assert_eq!(bridge.scratch_files(), 0);

    bridge.stop().await;
}
