#![allow(dead_code)]
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use resilient_mq::{
    config::{RegistryConfig, DEFAULT_INSTANCE},
    consumer::{Consumer, Delivery},
    error::Error,
    event::Event,
    net::MemoryBroker,
    Channel, Instance, Registry,
};
use serde_json::json;
use tokio::{
    sync::{broadcast, mpsc},
    time,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const TIMEOUT: Duration = Duration::from_secs(5);

// construct a subscriber that prints formatted traces to stdout
pub fn setup_logging() {
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Default instance on the in-memory broker, reconnecting every 10 ms.
pub fn memory_config(overlay: serde_json::Value) -> RegistryConfig {
    let mut config = RegistryConfig::default().with_instance(
        DEFAULT_INSTANCE,
        json!({"type": "memory", "reconnect": {"interval_ms": 10}}),
    );
    config.merge(RegistryConfig::default().with_instance(DEFAULT_INSTANCE, overlay));
    config
}

pub fn memory_registry(broker: &MemoryBroker, overlay: serde_json::Value) -> Registry {
    let registry = Registry::with_config(memory_config(overlay));
    registry.register_broker("memory", Arc::new(broker.clone()));
    registry
}

pub async fn connected_instance(registry: &Registry) -> Instance {
    let instance = registry.default_instance().unwrap();
    let watched = instance.clone();
    eventually(move || watched.is_connected()).await;
    instance
}

pub async fn ready_channel(registry: &Registry, name: &str) -> Channel {
    let channel = registry.channel(name, None).unwrap();
    let watched = channel.clone();
    eventually(move || watched.ready()).await;
    channel
}

/// Poll `condition` until it holds, panics after [`TIMEOUT`].
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    time::timeout(TIMEOUT, async {
        while !condition() {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("nothing received in time")
        .expect("sender dropped")
}

/// Assert nothing arrives within `wait`.
pub async fn assert_silent<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, wait: Duration) {
    if let Ok(Some(item)) = time::timeout(wait, rx.recv()).await {
        panic!("unexpected item: {:?}", item);
    }
}

/// Skip events until one of the given kind.
pub async fn wait_for(events: &mut broadcast::Receiver<Event>, kind: &str) -> Event {
    time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.kind() == kind => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} event in time", kind))
}

/////////////////////////////////////////////////////////////////////////////
/// Forwards deliveries and errors to the test.
pub struct TestConsumer {
    deliveries: mpsc::UnboundedSender<Delivery>,
    errors: mpsc::UnboundedSender<(String, Error)>,
}

pub fn test_consumer() -> (
    Arc<TestConsumer>,
    mpsc::UnboundedReceiver<Delivery>,
    mpsc::UnboundedReceiver<(String, Error)>,
) {
    let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
    let (errors, errors_rx) = mpsc::unbounded_channel();
    (
        Arc::new(TestConsumer { deliveries, errors }),
        deliveries_rx,
        errors_rx,
    )
}

#[async_trait]
impl Consumer for TestConsumer {
    async fn consume(&self, delivery: Delivery) {
        let _ = self.deliveries.send(delivery);
    }

    async fn error(&self, id: &str, err: &Error) {
        let _ = self.errors.send((id.to_owned(), err.clone()));
    }
}
