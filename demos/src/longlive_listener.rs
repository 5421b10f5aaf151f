use std::sync::Arc;

use async_trait::async_trait;
use resilient_mq::{
    callbacks::DefaultInstanceCallback,
    config::RegistryConfig,
    consumer::{AckMode, Consumer, Delivery},
    error::Error,
    Registry,
};
use serde_json::json;
use tokio::sync::Notify;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Prints each job, acks the ones with an id and rejects the rest back to the queue.
struct JobPrinter;

#[async_trait]
impl Consumer for JobPrinter {
    async fn consume(&self, mut delivery: Delivery) {
        println!(
            "job {:?} (redelivered: {}): {}",
            delivery.message_id(),
            delivery.redelivered(),
            delivery.payload()
        );
        let Some(acker) = delivery.take_acker() else {
            return;
        };
        acker.settle(delivery.payload().get("id").is_some());
    }

    async fn error(&self, id: &str, err: &Error) {
        println!("listener {} not registered yet: {}", id, err);
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    // construct a subscriber that prints formatted traces to stdout
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // listeners are re-registered after every reconnect, and survive restarts with a file cache
    let config = RegistryConfig::default().with_instance(
        "worker",
        json!({
            "client": {"host": "localhost", "port": 5672, "user": "user", "pass": "bitnami"},
            "reconnect": {"interval_ms": 2000},
            "channels": {"jobs": {"cache": {"type": "file", "path": "queues"}}},
        }),
    );
    let registry = Registry::with_config(config);
    let instance = registry.default_instance().unwrap();
    instance.register_callback(DefaultInstanceCallback);

    let channel = registry.channel("jobs", None).unwrap();
    let id = channel
        .listen(AckMode::ManualAck, Arc::new(JobPrinter), Some("job-printer".to_string()))
        .await
        .unwrap();
    println!("listening as {} on {}", id, channel.queue());

    // consume forever
    println!("consume forever..., ctrl+c to exit");
    let guard = Notify::new();
    guard.notified().await;
}
