//! Integration tests for the etcd backend.
//!
//! These run against a live cluster; start one locally and run with
//! `cargo test -- --ignored`.

use std::time::Duration;
use std::time::Instant;

use elastic_job::storage::etcd::EtcdStorage;
use elastic_job::BackendStorage;
use elastic_job::StorageConfig;

fn etcd_config() -> StorageConfig {
    let endpoints = std::env::var("ELASTIC_JOB_ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "127.0.0.1:2379".to_string())
        .split(',')
        .map(str::to_string)
        .collect();
    StorageConfig {
        endpoints,
        dial_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires a local etcd cluster"]
async fn test_lock_is_exclusive_across_instances() {
    let first = EtcdStorage::connect(&etcd_config()).await.unwrap();
    let second = EtcdStorage::connect(&etcd_config()).await.unwrap();

    first.try_lock("k1").await.unwrap();
    // Held by the first session, and a second attempt from the same
    // instance short-circuits as well.
    assert!(second.try_lock("k1").await.unwrap_err().is_locked());
    assert!(first.try_lock("k1").await.unwrap_err().is_locked());

    first.unlock("k1").await.unwrap();
    second.try_lock("k1").await.unwrap();
    second.unlock("k1").await.unwrap();

    // Distinct keys never contend.
    first.try_lock("k1").await.unwrap();
    second.try_lock("k2").await.unwrap();
    first.unlock("k1").await.unwrap();
    second.unlock("k2").await.unwrap();

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local etcd cluster"]
async fn test_unlock_without_lock_is_a_noop() {
    let storage = EtcdStorage::connect(&etcd_config()).await.unwrap();
    storage.unlock("never_locked").await.unwrap();
    storage.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local etcd cluster"]
async fn test_save_then_watch_delivers_the_value() {
    let storage = EtcdStorage::connect(&etcd_config()).await.unwrap();

    storage.save("k", "v", Duration::from_secs(1)).await.unwrap();

    let mut watch = storage.watch().expect("first watch call");
    assert!(storage.watch().is_none(), "watch stream is single-consumer");

    let fire = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("fire within five seconds")
        .expect("stream open");
    assert_eq!(fire.key, "k");
    assert_eq!(fire.value, "v");

    storage.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local etcd cluster"]
async fn test_fires_missed_while_down_are_replayed() {
    let storage = EtcdStorage::connect(&etcd_config()).await.unwrap();
    storage.save("key", "value", Duration::from_secs(1)).await.unwrap();
    storage.save("key2", "value2", Duration::from_secs(3)).await.unwrap();

    let mut watch = storage.watch().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let first = watch.recv().await.expect("first fire");
    assert_eq!(first.key, "key");

    // Abrupt shutdown: key2 expires with nobody watching.
    storage.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    // A restarted process resumes from the checkpointed revision.
    let restarted = EtcdStorage::connect(&etcd_config()).await.unwrap();
    let mut watch = restarted.watch().unwrap();
    let replayed = tokio::time::timeout(Duration::from_secs(10), watch.recv())
        .await
        .expect("replayed fire within ten seconds")
        .expect("stream open");
    assert_eq!(replayed.key, "key2");
    assert_eq!(replayed.value, "value2");

    restarted.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local etcd cluster"]
async fn test_multiple_keys_fire_in_delay_order() {
    let storage = EtcdStorage::connect(&etcd_config()).await.unwrap();

    // Keys whose TTLs are close together may fire out of order; keep two
    // seconds of slack between them.
    storage.save("k1", "v1", Duration::from_secs(1)).await.unwrap();
    storage.save("k2", "v2", Duration::from_secs(4)).await.unwrap();
    storage.save("k3", "v3", Duration::from_secs(8)).await.unwrap();

    let started = Instant::now();
    let mut watch = storage.watch().unwrap();
    for (expected_key, expected_value, min_delay) in
        [("k1", "v1", 1u64), ("k2", "v2", 4), ("k3", "v3", 8)]
    {
        let fire = tokio::time::timeout(Duration::from_secs(12), watch.recv())
            .await
            .expect("fire before the deadline")
            .expect("stream open");
        assert_eq!(fire.key, expected_key);
        assert_eq!(fire.value, expected_value);
        assert!(
            started.elapsed() >= Duration::from_secs(min_delay),
            "{expected_key} fired before its delay elapsed"
        );
    }

    storage.close().await.unwrap();
}
