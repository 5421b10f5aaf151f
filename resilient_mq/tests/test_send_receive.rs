use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use resilient_mq::{
    callbacks::SendCallback, consumer::AckMode, error::Error, net::MemoryBroker,
};
use serde_json::json;
mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_then_receive() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    common::connected_instance(&registry).await;

    let id = registry
        .send("q", &json!({"a": "message"}), None, None)
        .await
        .unwrap();
    assert!(!id.is_empty());

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    let receive_id = registry
        .receive("q", AckMode::AutoAck, consumer, Some("r1".to_string()))
        .await
        .unwrap();
    assert_eq!("r1", receive_id);

    let delivery = common::recv(&mut deliveries).await;
    assert_eq!(&json!({"a": "message"}), delivery.payload());
    assert_eq!(Some(id.as_str()), delivery.message_id());
    assert_eq!("r1", delivery.id());
    assert_eq!("_default_-q", delivery.queue());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_before_connected_is_published_later() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let registry = common::memory_registry(&broker, json!({}));
    let channel = registry.channel("q", None).unwrap();

    let outcomes: Arc<Mutex<Vec<Result<String, Error>>>> = Arc::default();
    let sink = outcomes.clone();
    let callback: SendCallback = Arc::new(move |outcome| sink.lock().unwrap().push(outcome));
    let id = channel
        .send(&json!({"a": 1}), Some(callback), None)
        .await
        .unwrap();

    // not connected yet: the caller is told, the message stays cached
    {
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(1, outcomes.len());
        assert!(matches!(outcomes[0], Err(Error::NotConnected(_))));
    }
    let pending = channel.pending().await;
    assert_eq!(1, pending.len());
    assert_eq!(id, pending[0].id);

    broker.set_reachable(true);
    let watched = outcomes.clone();
    common::eventually(move || watched.lock().unwrap().len() == 2).await;
    assert_eq!(Ok(id.clone()), outcomes.lock().unwrap()[1]);
    assert_eq!(vec![Some(id)], broker.publish_history("_default_-q"));
    assert!(channel.pending().await.is_empty());
    assert_eq!(1, broker.message_count("_default_-q"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listen_preserves_order() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    common::ready_channel(&registry, "q").await;

    registry.send("q", &json!({"a": "m1"}), None, None).await.unwrap();
    registry.send("q", &json!({"a": "m2"}), None, None).await.unwrap();

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    registry
        .listen("q", AckMode::AutoAck, consumer, None)
        .await
        .unwrap();
    assert_eq!(&json!({"a": "m1"}), common::recv(&mut deliveries).await.payload());
    assert_eq!(&json!({"a": "m2"}), common::recv(&mut deliveries).await.payload());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_delivers_at_most_one_auto_ack() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;
    for n in 0..3 {
        channel.send(&json!({ "n": n }), None, None).await.unwrap();
    }
    assert_eq!(3, broker.message_count("_default_-q"));

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    let id = channel
        .receive(AckMode::AutoAck, consumer, None)
        .await
        .unwrap();
    let delivery = common::recv(&mut deliveries).await;
    assert_eq!(&json!({"n": 0}), delivery.payload());
    common::assert_silent(&mut deliveries, Duration::from_millis(100)).await;

    // the consumer is cancelled and the rest is back in the queue
    let watched = broker.clone();
    common::eventually(move || watched.message_count("_default_-q") == 2).await;
    assert!(broker.consumer_tags("_default_-q").is_empty());
    assert!(!channel.is_consuming(&id));
    assert!(channel.pending().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_manual_ack_cancels_after_settle() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;
    channel.send(&json!("first"), None, None).await.unwrap();
    channel.send(&json!("second"), None, None).await.unwrap();

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    let id = channel
        .receive(AckMode::ManualAck, consumer, None)
        .await
        .unwrap();
    let mut delivery = common::recv(&mut deliveries).await;
    assert_eq!(&json!("first"), delivery.payload());

    // still registered until the delivery is settled
    assert_eq!(vec![id.clone()], broker.consumer_tags("_default_-q"));
    delivery.take_acker().unwrap().ack();

    let watched = broker.clone();
    common::eventually(move || watched.consumer_tags("_default_-q").is_empty()).await;
    let watched = broker.clone();
    common::eventually(move || watched.message_count("_default_-q") == 1).await;
    common::assert_silent(&mut deliveries, Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_id_reused_only_after_cancel() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;
    channel.send(&json!("first"), None, None).await.unwrap();
    channel.send(&json!("second"), None, None).await.unwrap();

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    channel
        .receive(AckMode::ManualAck, consumer, Some("r".to_string()))
        .await
        .unwrap();
    let mut delivery = common::recv(&mut deliveries).await;
    assert!(channel.pending().await.is_empty());

    // the broker consumer "r" is alive until the delivery is settled
    let (consumer, mut again, mut errors) = common::test_consumer();
    let err = channel
        .receive(AckMode::AutoAck, consumer.clone(), Some("r".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelUseError(_)));
    assert!(channel.pending().await.is_empty());
    assert_eq!(vec!["r".to_string()], broker.consumer_tags("_default_-q"));

    delivery.take_acker().unwrap().ack();
    let watched = channel.clone();
    common::eventually(move || !watched.is_consuming("r")).await;
    channel
        .receive(AckMode::AutoAck, consumer, Some("r".to_string()))
        .await
        .unwrap();
    assert_eq!(&json!("second"), common::recv(&mut again).await.payload());
    common::assert_silent(&mut errors, Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_manual_nack_requeues() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;
    let sent = channel.send(&json!({"a": 1}), None, None).await.unwrap();

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    channel
        .receive(AckMode::ManualAck, consumer, None)
        .await
        .unwrap();
    let mut delivery = common::recv(&mut deliveries).await;
    delivery.take_acker().unwrap().nack();

    let watched = broker.clone();
    common::eventually(move || {
        watched.message_count("_default_-q") == 1 && watched.consumer_tags("_default_-q").is_empty()
    })
    .await;

    // a second receive gets the requeued message
    let (consumer, mut deliveries, _errors) = common::test_consumer();
    channel
        .receive(AckMode::AutoAck, consumer, None)
        .await
        .unwrap();
    let delivery = common::recv(&mut deliveries).await;
    assert_eq!(Some(sent.as_str()), delivery.message_id());
    assert!(delivery.redelivered());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listen_manual_ack() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    channel
        .listen(AckMode::ManualAck, consumer, Some("l1".to_string()))
        .await
        .unwrap();
    for n in 0..2 {
        channel.send(&json!(n), None, None).await.unwrap();
    }
    for n in 0..2 {
        let mut delivery = common::recv(&mut deliveries).await;
        assert_eq!(&json!(n), delivery.payload());
        delivery.take_acker().unwrap().ack();
    }
    // still listening, the registration stays cached
    assert!(channel.is_consuming("l1"));
    assert_eq!(1, channel.pending().await.len());
    assert_eq!(0, broker.message_count("_default_-q"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unlisten_stops_delivery() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;

    let (consumer, mut deliveries, _errors) = common::test_consumer();
    let id = registry
        .listen("q", AckMode::AutoAck, consumer, None)
        .await
        .unwrap();
    registry.unlisten("q", &id).await.unwrap();
    assert!(!channel.is_consuming(&id));
    assert!(channel.pending().await.is_empty());
    assert!(broker.consumer_tags("_default_-q").is_empty());

    channel.send(&json!("late"), None, None).await.unwrap();
    common::assert_silent(&mut deliveries, Duration::from_millis(100)).await;
    assert_eq!(1, broker.message_count("_default_-q"));

    // unknown ids are fine
    channel.unlisten("unknown").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_listen_rejected() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;

    let (consumer, _deliveries, _errors) = common::test_consumer();
    channel
        .listen(AckMode::AutoAck, consumer.clone(), Some("dup".to_string()))
        .await
        .unwrap();
    let err = channel
        .listen(AckMode::AutoAck, consumer, Some("dup".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelUseError(_)));
    assert_eq!(1, broker.consumer_tags("_default_-q").len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_destroy_deletes_queue_and_cache() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(&broker, json!({}));
    let channel = common::ready_channel(&registry, "q").await;

    let (consumer, _deliveries, _errors) = common::test_consumer();
    channel
        .listen(AckMode::AutoAck, consumer, None)
        .await
        .unwrap();
    channel.send(&json!(1), None, None).await.unwrap();
    assert!(broker.has_queue("_default_-q"));

    channel.destroy().await.unwrap();
    assert!(!broker.has_queue("_default_-q"));
    assert!(channel.pending().await.is_empty());
    assert!(!channel.ready());

    // the channel is usable again
    channel.send(&json!(2), None, None).await.unwrap();
    assert!(channel.ready());
    assert_eq!(1, broker.message_count("_default_-q"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_declared_from_config() {
    common::setup_logging();
    let broker = MemoryBroker::new();
    let registry = common::memory_registry(
        &broker,
        json!({"channels": {"uploads": {"queue": {"durable": false, "message_ttl": 1000}}}}),
    );
    common::ready_channel(&registry, "uploads").await;
    let args = broker.queue_arguments("_default_-uploads").unwrap();
    assert!(!args.durable);
    assert_eq!(Some(1000), args.message_ttl);

    common::ready_channel(&registry, "other").await;
    let args = broker.queue_arguments("_default_-other").unwrap();
    assert!(args.durable);
    assert_eq!(Some(86_400_000), args.message_ttl);
}
