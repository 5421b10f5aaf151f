use std::sync::Arc;

use resilient_mq::{
    config::{RegistryConfig, DEFAULT_INSTANCE},
    error::Error,
    net::MemoryBroker,
    Registry,
};
use serde_json::json;
mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_instance_and_queue_names() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));

    let instance = registry.default_instance().unwrap();
    assert_eq!(DEFAULT_INSTANCE, instance.name());
    // built once, shared afterwards
    let again = registry.instance(Some(DEFAULT_INSTANCE)).unwrap();
    assert_eq!(instance.name(), again.name());
    assert_eq!(1, registry.instances().len());

    let channel = registry.channel("jobs", None).unwrap();
    assert_eq!("jobs", channel.name());
    assert_eq!("_default_-jobs", channel.queue());
    let watched = channel.clone();
    common::eventually(move || watched.ready()).await;
    assert!(broker.has_queue("_default_-jobs"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_flag_picks_instance() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let config = RegistryConfig::from_json_value(json!({
        "instances": {
            "alpha": {"type": "memory"},
            "beta": {"type": "memory", "default": true},
        }
    }))
    .unwrap();
    let registry = Registry::with_config(config);
    registry.register_broker("memory", Arc::new(broker.clone()));

    assert_eq!("beta", registry.default_instance().unwrap().name());
    let channel = registry.channel("jobs", Some("alpha")).unwrap();
    assert_eq!("alpha-jobs", channel.queue());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_broker_type() {
    common::setup_logging();
    let registry = Registry::with_config(
        RegistryConfig::default().with_instance("x", json!({"type": "kafka"})),
    );
    let err = registry.instance(Some("x")).err().unwrap();
    assert!(matches!(err, Error::ConfigError(_)));
    assert!(registry.instances().is_empty());
    // nothing built, nothing to wait for
    assert!(registry.ready());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_cache_type() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(
        &broker,
        json!({"channel_defaults": {"cache": {"type": "redis"}}}),
    );
    let err = registry.channel("jobs", None).err().unwrap();
    assert!(matches!(err, Error::ConfigError(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_channels_set_up_on_connect() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(
        &broker,
        json!({"app_id": "billing", "channels": {"invoices": {}, "refunds": {"queue": {"durable": false}}}}),
    );
    let instance = common::connected_instance(&registry).await;
    let watched = registry.clone();
    common::eventually(move || watched.ready()).await;

    let names: Vec<String> = instance.channels().iter().map(|c| c.name().to_owned()).collect();
    assert_eq!(vec!["invoices", "refunds"], names);
    assert!(broker.has_queue("_default_-invoices"));
    assert!(!broker.queue_arguments("_default_-refunds").unwrap().durable);
    let invoices = instance.channel("invoices").unwrap();
    assert_eq!(Some("billing".to_string()), invoices.config().message.app_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configure_merges_or_replaces() {
    common::setup_logging();
    let registry = Registry::with_config(
        RegistryConfig::default()
            .with_instance("a", json!({"client": {"host": "rabbit.local", "port": 5673}})),
    );
    registry.configure(
        RegistryConfig::default().with_instance("a", json!({"client": {"port": 5674}})),
        true,
    );
    let resolved = registry.config().resolve("a").unwrap();
    assert_eq!("rabbit.local", resolved.client.host);
    assert_eq!(5674, resolved.client.port);

    registry.configure(
        RegistryConfig::default().with_instance("b", json!({"type": "memory"})),
        false,
    );
    let names: Vec<String> = registry.config().instances.keys().cloned().collect();
    assert_eq!(vec!["b"], names);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_closes_instances() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let instance = common::connected_instance(&registry).await;
    assert!(registry.ready());
    assert_eq!(1, broker.open_connections());

    registry.reset(Some(common::memory_config(json!({})))).await;
    assert!(!instance.is_connected());
    assert!(registry.instances().is_empty());
    assert_eq!(0, broker.open_connections());
    assert!(registry.ready());

    // the next access builds a fresh instance, not ready until it connects
    broker.set_reachable(false);
    let fresh = registry.default_instance().unwrap();
    assert!(!registry.ready());
    broker.set_reachable(true);
    let watched = fresh.clone();
    common::eventually(move || watched.is_connected()).await;
    assert!(registry.ready());
    assert_eq!(1, broker.open_connections());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_errors_of_every_instance_are_aggregated() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let config = RegistryConfig::default()
        .with_instance("a", json!({"type": "memory"}))
        .with_instance("b", json!({"type": "memory"}));
    let registry = Registry::with_config(config);
    registry.register_broker("memory", Arc::new(broker.clone()));
    let mut errors = registry.subscribe();

    for name in ["a", "b"] {
        let instance = registry.instance(Some(name)).unwrap();
        let watched = instance.clone();
        common::eventually(move || watched.is_connected()).await;
    }
    assert_eq!(2, broker.drop_connections());

    let mut sources = Vec::new();
    for _ in 0..2 {
        match common::wait_for(&mut errors, "error").await {
            resilient_mq::event::Event::Error { source, error } => {
                assert!(error.is_transient());
                sources.push(source);
            }
            other => panic!("unexpected event: {}", other),
        }
    }
    sources.sort();
    assert_eq!(vec!["a", "b"], sources);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_from_toml_file() {
    common::setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queues.toml");
    std::fs::write(
        &path,
        r#"
[instances.main]
type = "memory"
reconnect = { interval_ms = 250, max_attempts = 5 }

[instances.main.channels.uploads]
cache = { type = "file", path = "/var/lib/queues" }
"#,
    )
    .unwrap();

    let config = RegistryConfig::from_file(&path).await.unwrap();
    assert_eq!(Some("main"), config.default_instance_name());
    let resolved = config.resolve("main").unwrap();
    assert_eq!("memory", resolved.broker);
    assert_eq!(250, resolved.reconnect.interval_ms);
    assert_eq!(Some(5), resolved.reconnect.max_attempts);
    assert_eq!("file", resolved.channel("uploads").cache.kind);
    assert_eq!("memory", resolved.channel("other").cache.kind);

    let err = RegistryConfig::from_file(dir.path().join("missing.toml"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}
