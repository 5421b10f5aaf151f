use std::{sync::Arc, time::Duration};

use resilient_mq::{
    callbacks::{DefaultInstanceCallback, SendCallback},
    config::RegistryConfig,
    consumer::{AckMode, DefaultConsumer},
    Registry,
};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    // construct a subscriber that prints formatted traces to stdout
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // one instance on a local RabbitMQ server
    let config = RegistryConfig::default().with_instance(
        "_default_",
        json!({
            "client": {"host": "localhost", "port": 5672, "user": "user", "pass": "bitnami"},
        }),
    );
    let registry = Registry::with_config(config);
    registry
        .default_instance()
        .unwrap()
        .register_callback(DefaultInstanceCallback);

    //////////////////////////////////////////////////////////////////////////////
    // publish, the callback reports the outcome
    let callback: SendCallback = Arc::new(|outcome| match outcome {
        Ok(id) => println!("published {}", id),
        Err(err) => println!("not published yet: {}", err),
    });
    let id = registry
        .send("pub-sub", &json!({"greeting": "hello"}), Some(callback), None)
        .await
        .unwrap();
    println!("sent {}", id);

    // receive a single message, acked automatically
    registry
        .receive(
            "pub-sub",
            AckMode::AutoAck,
            Arc::new(DefaultConsumer::new()),
            None,
        )
        .await
        .unwrap();

    // wait for the delivery
    tokio::time::sleep(Duration::from_secs(1)).await;

    // explicitly close
    registry.reset(None).await;
}
