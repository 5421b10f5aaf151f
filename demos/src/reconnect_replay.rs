//! Runs without a server: the in-memory broker loses its connection, messages sent meanwhile are
//! published once the instance reconnects.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use resilient_mq::{
    callbacks::{DefaultInstanceCallback, SendCallback},
    config::RegistryConfig,
    consumer::{AckMode, Consumer, Delivery},
    net::MemoryBroker,
    Registry,
};
use serde_json::json;
use tokio::{sync::mpsc, time};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

struct Forward(mpsc::UnboundedSender<Delivery>);

#[async_trait]
impl Consumer for Forward {
    async fn consume(&self, delivery: Delivery) {
        let _ = self.0.send(delivery);
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

    let broker = MemoryBroker::new();
    let config = RegistryConfig::default().with_instance(
        "_default_",
        json!({"type": "memory", "reconnect": {"interval_ms": 200}}),
    );
    let registry = Registry::with_config(config);
    registry.register_broker("memory", Arc::new(broker.clone()));
    let instance = registry.default_instance().unwrap();
    instance.register_callback(DefaultInstanceCallback);

    let (tx, mut rx) = mpsc::unbounded_channel();
    registry
        .listen("events", AckMode::AutoAck, Arc::new(Forward(tx)), None)
        .await
        .unwrap();

    //////////////////////////////////////////////////////////////////////////////
    // take the broker down
    broker.set_reachable(false);
    broker.drop_connections();
    time::sleep(Duration::from_millis(100)).await;

    let callback: SendCallback = Arc::new(|outcome| match outcome {
        Ok(id) => println!("published {}", id),
        Err(err) => println!("cached: {}", err),
    });
    for n in 0..3 {
        registry
            .send("events", &json!({ "n": n }), Some(callback.clone()), None)
            .await
            .unwrap();
    }

    // bring it back, the pending messages and the listener are replayed
    broker.set_reachable(true);
    for _ in 0..3 {
        match time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(delivery)) => println!("received {}", delivery.payload()),
            _ => {
                println!("no delivery in time");
                break;
            }
        }
    }

    registry.reset(None).await;
}
