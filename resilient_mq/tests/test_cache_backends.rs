use std::sync::Arc;

use resilient_mq::{
    cache::{FileCache, OperationKind, PendingCache, PendingOperation, CACHE_BACKENDS},
    config::CacheConfig,
    consumer::{AckMode, DefaultConsumer},
    error::Error,
};
use serde_json::json;
mod common;

fn send(id: &str, n: u64) -> PendingOperation {
    PendingOperation::send(id.to_string(), json!({ "n": n }), None)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_backend_honors_the_contract() {
    common::setup_logging();
    for (key, constructor) in CACHE_BACKENDS {
        let root = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            kind: key.to_string(),
            path: root.path().to_path_buf(),
        };
        let cache = constructor(&config).unwrap();

        cache.store("q", send("a", 1)).await.unwrap();
        cache.store("q", send("b", 2)).await.unwrap();
        cache
            .store(
                "q",
                PendingOperation::listen(
                    "c".to_string(),
                    AckMode::ManualAck,
                    Arc::new(DefaultConsumer::new()),
                ),
            )
            .await
            .unwrap();
        cache.store("other", send("a", 3)).await.unwrap();

        let ids: Vec<String> = cache
            .get("q")
            .await
            .iter()
            .map(|op| op.id().to_owned())
            .collect();
        assert_eq!(vec!["a", "b", "c"], ids, "backend {}", key);
        let listen = &cache.get("q").await[2];
        assert_eq!(OperationKind::Listen, listen.kind());
        assert_eq!(AckMode::ManualAck, listen.ack_mode());
        assert!(listen.consumer.is_some(), "backend {}", key);

        // replacing keeps a single entry
        cache.store("q", send("a", 4)).await.unwrap();
        let operations = cache.get("q").await;
        assert_eq!(3, operations.len(), "backend {}", key);
        let replaced = operations.iter().find(|op| op.id() == "a").unwrap();
        assert_eq!(Some(json!({"n": 4})), replaced.record.payload);

        cache.remove("q", "b").await;
        cache.remove("q", "unknown").await;
        assert_eq!(2, cache.get("q").await.len(), "backend {}", key);

        cache.clear("q").await;
        assert!(cache.get("q").await.is_empty(), "backend {}", key);
        assert_eq!(1, cache.get("other").await.len(), "backend {}", key);
        assert!(cache.get("never").await.is_empty(), "backend {}", key);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_id_is_rejected() {
    common::setup_logging();
    let root = tempfile::tempdir().unwrap();
    for (key, constructor) in CACHE_BACKENDS {
        let config = CacheConfig {
            kind: key.to_string(),
            path: root.path().join("cache"),
        };
        let cache = constructor(&config).unwrap();
        let err = cache.store("q", send("", 1)).await.unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)), "backend {}", key);
        assert!(cache.get("q").await.is_empty());
    }
    // rejected before touching the disk
    assert!(!root.path().join("cache").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_cache_survives_restart() {
    common::setup_logging();
    let root = tempfile::tempdir().unwrap();
    {
        let cache = FileCache::new(root.path());
        cache.store("_default_-q", send("first", 1)).await.unwrap();
        cache.store("_default_-q", send("second", 2)).await.unwrap();
        cache
            .store(
                "_default_-q",
                PendingOperation::receive(
                    "third".to_string(),
                    AckMode::AutoAck,
                    Arc::new(DefaultConsumer::new()),
                ),
            )
            .await
            .unwrap();
        cache.remove("_default_-q", "second").await;
    }

    let cache = FileCache::new(root.path());
    let operations = cache.get("_default_-q").await;
    let ids: Vec<&str> = operations.iter().map(|op| op.id()).collect();
    assert_eq!(vec!["first", "third"], ids);
    assert_eq!(Some(json!({"n": 1})), operations[0].record.payload);
    assert_eq!(OperationKind::Receive, operations[1].kind());
    // consumers do not survive a restart
    assert!(operations[1].consumer.is_none());
    assert!(operations[0].callback.is_none());
}
