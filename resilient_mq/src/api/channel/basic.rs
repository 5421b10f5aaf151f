use std::sync::{atomic::Ordering, Arc, Weak};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::{Attached, Channel, ConsumerSlot, SharedChannelInner};
use crate::{
    api::{
        cache::{OperationKind, PendingCache, PendingOperation},
        callbacks::SendCallback,
        consumer::{AckMode, Acknowledger, Consumer, Delivery},
        error::Error,
        utils::{generate_id, lock, timestamp_secs},
        Result,
    },
    net::{BrokerChannel, IncomingDelivery},
};

const CONTENT_TYPE_JSON: &str = "application/json";

/////////////////////////////////////////////////////////////////////////////
/// Publish to the default exchange, routed by queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicPublishArguments {
    pub exchange: String,
    pub routing_key: String,
    /// Ask the broker to return the message if no queue takes it.
    pub mandatory: bool,
}

impl BasicPublishArguments {
    pub fn new(queue: &str) -> Self {
        Self {
            exchange: String::new(),
            routing_key: queue.to_string(),
            mandatory: false,
        }
    }

    pub fn mandatory(&mut self, mandatory: bool) -> &mut Self {
        self.mandatory = mandatory;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}

/// Metadata envelope of a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub app_id: Option<String>,
    pub persistent: bool,
}

impl MessageProperties {
    pub fn message_id(&mut self, message_id: &str) -> &mut Self {
        self.message_id = Some(message_id.to_string());
        self
    }

    pub fn timestamp(&mut self, timestamp: u64) -> &mut Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn content_type(&mut self, content_type: &str) -> &mut Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn app_id(&mut self, app_id: &str) -> &mut Self {
        self.app_id = Some(app_id.to_string());
        self
    }

    pub fn persistent(&mut self, persistent: bool) -> &mut Self {
        self.persistent = persistent;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicConsumeArguments {
    pub queue: String,
    pub consumer_tag: String,
    // In automatic acknowledgement mode,
    // a message is considered to be successfully delivered immediately after it is sent
    pub no_ack: bool,
}

impl BasicConsumeArguments {
    pub fn new(queue: &str, consumer_tag: &str) -> Self {
        Self {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            no_ack: false,
        }
    }

    pub fn no_ack(&mut self, no_ack: bool) -> &mut Self {
        self.no_ack = no_ack;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}

/////////////////////////////////////////////////////////////////////////////
impl Channel {
    /// Publish `payload` as JSON, returns the operation id which is also the message id.
    ///
    /// The operation is cached before anything else. The outcome goes to `callback`: `Ok(id)` once
    /// published, `Err` if the channel could not be set up or the publish failed, in which case the
    /// message stays cached and is published after the next (re)connect.
    ///
    /// Returns `Err` only if the operation could not be cached.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        callback: Option<SendCallback>,
        id: Option<String>,
    ) -> Result<String> {
        let payload = serde_json::to_value(payload)?;
        let id = id.unwrap_or_else(generate_id);
        let operation = PendingOperation::send(id.clone(), payload, callback);

        let _guard = self.shared.op_lock.lock().await;
        self.send_locked(operation).await?;
        Ok(id)
    }

    pub(super) async fn send_locked(&self, operation: PendingOperation) -> Result<()> {
        let queue = self.queue();
        self.shared.cache.store(queue, operation.clone()).await?;

        let attached = match self.setup_locked().await {
            Ok(attached) => attached,
            Err(err) => {
                debug!(queue, id = operation.id(), "send deferred: {}", err);
                operation.notify(Err(err));
                return Ok(());
            }
        };

        self.shared.cache.remove(queue, operation.id()).await;
        match self.publish(&attached, &operation).await {
            Ok(()) => {
                trace!(queue, id = operation.id(), "message published");
                operation.notify(Ok(operation.id().to_owned()));
            }
            Err(err) => {
                warn!(queue, id = operation.id(), "publish failed: {}", err);
                if let Err(store_err) = self.shared.cache.store(queue, operation.clone()).await {
                    warn!(queue, id = operation.id(), "message lost: {}", store_err);
                }
                operation.notify(Err(err));
            }
        }
        Ok(())
    }

    async fn publish(&self, attached: &Attached, operation: &PendingOperation) -> Result<()> {
        let content = match &operation.record.payload {
            Some(payload) => serde_json::to_vec(payload)?,
            None => serde_json::to_vec(&serde_json::Value::Null)?,
        };
        let message = &self.shared.config.message;
        let args = BasicPublishArguments::new(self.queue())
            .mandatory(message.mandatory)
            .finish();
        let mut properties = MessageProperties::default();
        properties
            .message_id(operation.id())
            .timestamp(timestamp_secs())
            .content_type(CONTENT_TYPE_JSON)
            .persistent(message.persistent);
        if let Some(app_id) = &message.app_id {
            properties.app_id(app_id);
        }
        attached
            .handle
            .basic_publish(&args, &properties, content)
            .await
    }

    /// Register a long-lived consumer under `id`, returns the id.
    ///
    /// The registration is cached until [`unlisten`](Channel::unlisten), so it is re-registered
    /// under the same id after every reconnect. Setup failures go to [`Consumer::error`].
    pub async fn listen(
        &self,
        ack_mode: AckMode,
        consumer: Arc<dyn Consumer>,
        id: Option<String>,
    ) -> Result<String> {
        let id = id.unwrap_or_else(generate_id);
        let _guard = self.shared.op_lock.lock().await;
        self.check_not_consuming(&id)?;
        self.consume_locked(PendingOperation::listen(id.clone(), ack_mode, consumer))
            .await?;
        Ok(id)
    }

    /// Like [`listen`](Channel::listen), for a single message.
    ///
    /// On the first delivery the cached operation is removed and the consumer cancelled, then the
    /// consumer is called once. With [`AckMode::ManualAck`] the cancel waits until the delivery
    /// is settled. Until the cancel, `id` stays registered and cannot be reused on this channel.
    pub async fn receive(
        &self,
        ack_mode: AckMode,
        consumer: Arc<dyn Consumer>,
        id: Option<String>,
    ) -> Result<String> {
        let id = id.unwrap_or_else(generate_id);
        let _guard = self.shared.op_lock.lock().await;
        self.check_not_consuming(&id)?;
        self.consume_locked(PendingOperation::receive(id.clone(), ack_mode, consumer))
            .await?;
        Ok(id)
    }

    /// Cancel the consumer registered under `id` and forget its cached operation.
    pub async fn unlisten(&self, id: &str) -> Result<()> {
        let _guard = self.shared.op_lock.lock().await;
        self.shared.cache.remove(self.queue(), id).await;

        let slot = lock(&self.shared.consumers).remove(id);
        let Some(slot) = slot else {
            return Ok(());
        };
        let attached = lock(&self.shared.attached).clone();
        let outcome = match attached {
            Some(attached) => attached.handle.basic_cancel(id).await,
            None => Ok(()),
        };
        // the task drains what the broker pushed before the cancel
        let _ = slot.stop.send(());
        info!(queue = self.queue(), id, "consumer cancelled");
        outcome
    }

    fn check_not_consuming(&self, id: &str) -> Result<()> {
        if self.is_consuming(id) {
            return Err(Error::ChannelUseError(format!(
                "consumer {} is already registered on {}",
                id,
                self.queue()
            )));
        }
        Ok(())
    }

    pub(super) async fn consume_locked(&self, operation: PendingOperation) -> Result<()> {
        let queue = self.queue();
        let consumer = operation.consumer.clone().ok_or_else(|| {
            Error::ChannelUseError(format!("{} {} has no consumer", operation.kind(), operation.id()))
        })?;
        self.shared.cache.store(queue, operation.clone()).await?;
        let id = operation.id().to_owned();

        let attached = match self.setup_locked().await {
            Ok(attached) => attached,
            Err(err) => {
                debug!(queue, id = %id, "{} deferred: {}", operation.kind(), err);
                notify_consumer(consumer, id, err);
                return Ok(());
            }
        };

        let kind = operation.kind();
        let no_ack = kind == OperationKind::Listen && operation.ack_mode() == AckMode::AutoAck;
        let args = BasicConsumeArguments::new(queue, &id).no_ack(no_ack).finish();
        let deliveries = match attached.handle.basic_consume(&args).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                warn!(queue, id = %id, "{} failed: {}", kind, err);
                notify_consumer(consumer, id, err);
                return Ok(());
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        let registered = {
            let mut consumers = lock(&self.shared.consumers);
            if self.shared.generation.load(Ordering::SeqCst) == attached.generation {
                consumers.insert(
                    id.clone(),
                    ConsumerSlot {
                        token,
                        stop: stop_tx,
                    },
                );
                true
            } else {
                false
            }
        };
        if !registered {
            debug!(queue, id = %id, "channel detached during {}, kept for replay", kind);
            return Ok(());
        }

        info!(queue, id = %id, ack_mode = ?operation.ack_mode(), "{} registered", kind);
        let task = ConsumerTask {
            channel: Arc::downgrade(&self.shared),
            queue: queue.to_owned(),
            handle: attached.handle,
            cache: self.shared.cache.clone(),
            operation,
            consumer,
            token,
        };
        if kind == OperationKind::Receive {
            tokio::spawn(task.run_receiver(deliveries, stop_rx));
        } else {
            tokio::spawn(task.run_listener(deliveries, stop_rx));
        }
        Ok(())
    }
}

/// Report to the consumer outside of the operation lock.
fn notify_consumer(consumer: Arc<dyn Consumer>, id: String, err: Error) {
    tokio::spawn(async move {
        consumer.error(&id, &err).await;
    });
}

/// Ack or requeue a manual-ack delivery once its [`Acknowledger`] settles or is dropped.
async fn settle(
    handle: Arc<dyn BrokerChannel>,
    queue: String,
    delivery_tag: u64,
    settled: oneshot::Receiver<bool>,
) {
    let outcome = match settled.await {
        Ok(true) => handle.basic_ack(delivery_tag).await,
        Ok(false) => handle.basic_nack(delivery_tag, true).await,
        Err(_) => {
            debug!(queue = %queue, delivery_tag, "delivery dropped unsettled, requeue");
            handle.basic_nack(delivery_tag, true).await
        }
    };
    if let Err(err) = outcome {
        warn!(queue = %queue, delivery_tag, "failed to settle delivery: {}", err);
    }
}

/////////////////////////////////////////////////////////////////////////////
enum FirstDelivery {
    Message(IncomingDelivery, serde_json::Value),
    Stopped,
    Ended,
}

/// Dispatches the deliveries of one broker consumer to the user consumer.
struct ConsumerTask {
    channel: Weak<SharedChannelInner>,
    queue: String,
    handle: Arc<dyn BrokerChannel>,
    cache: Arc<dyn PendingCache>,
    operation: PendingOperation,
    consumer: Arc<dyn Consumer>,
    token: u64,
}

impl ConsumerTask {
    fn id(&self) -> &str {
        self.operation.id()
    }

    fn manual_ack(&self) -> bool {
        self.operation.ack_mode() == AckMode::ManualAck
    }

    /// Remove the consumer slot, if it is still ours.
    fn release(&self) {
        if let Some(shared) = self.channel.upgrade() {
            let mut consumers = lock(&shared.consumers);
            if consumers.get(self.id()).map(|slot| slot.token) == Some(self.token) {
                consumers.remove(self.id());
            }
        }
    }

    async fn requeue(&self, delivery_tag: u64) {
        if let Err(err) = self.handle.basic_nack(delivery_tag, true).await {
            debug!(queue = %self.queue, delivery_tag, "requeue failed: {}", err);
        }
    }

    /// A message that is not JSON is rejected without requeue.
    async fn reject(&self, incoming: &IncomingDelivery, err: serde_json::Error) {
        let err = Error::from(err);
        warn!(queue = %self.queue, id = self.id(), "reject message: {}", err);
        if self.manual_ack() || self.operation.kind() == OperationKind::Receive {
            if let Err(nack_err) = self.handle.basic_nack(incoming.delivery_tag, false).await {
                debug!(queue = %self.queue, "reject failed: {}", nack_err);
            }
        }
        self.consumer.error(self.id(), &err).await;
    }

    async fn deliver(&self, incoming: IncomingDelivery) {
        let payload = match serde_json::from_slice(&incoming.content) {
            Ok(payload) => payload,
            Err(err) => return self.reject(&incoming, err).await,
        };
        let (acker, settled) = if self.manual_ack() {
            let (acker, settled) = Acknowledger::new(incoming.delivery_tag);
            (Some(acker), Some(settled))
        } else {
            (None, None)
        };
        let delivery = Delivery::new(
            self.id(),
            &self.queue,
            incoming.message_id,
            incoming.redelivered,
            payload,
            acker,
        );
        self.consumer.consume(delivery).await;
        if let Some(settled) = settled {
            tokio::spawn(settle(
                self.handle.clone(),
                self.queue.clone(),
                incoming.delivery_tag,
                settled,
            ));
        }
    }

    async fn run_listener(
        self,
        mut deliveries: mpsc::UnboundedReceiver<IncomingDelivery>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let stopped = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break true,
                incoming = deliveries.recv() => match incoming {
                    Some(incoming) => self.deliver(incoming).await,
                    None => break false,
                },
            }
        };
        if stopped {
            // pushed before the cancel: auto-ack ones are ours already, others go back
            while let Some(incoming) = deliveries.recv().await {
                if self.manual_ack() {
                    self.requeue(incoming.delivery_tag).await;
                } else {
                    self.deliver(incoming).await;
                }
            }
        }
        self.release();
        trace!(queue = %self.queue, id = self.id(), "exit listener");
    }

    async fn run_receiver(
        self,
        mut deliveries: mpsc::UnboundedReceiver<IncomingDelivery>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let first = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break FirstDelivery::Stopped,
                incoming = deliveries.recv() => match incoming {
                    Some(incoming) => match serde_json::from_slice(&incoming.content) {
                        Ok(payload) => break FirstDelivery::Message(incoming, payload),
                        Err(err) => self.reject(&incoming, err).await,
                    },
                    None => break FirstDelivery::Ended,
                },
            }
        };
        let (incoming, payload) = match first {
            FirstDelivery::Message(incoming, payload) => (incoming, payload),
            FirstDelivery::Stopped => {
                self.drain(deliveries).await;
                self.release();
                return;
            }
            FirstDelivery::Ended => {
                self.release();
                return;
            }
        };

        // done with the cached operation, replay must not see it again. The slot stays until
        // the broker consumer is cancelled, its tag is still in use on this channel.
        if let Some(shared) = self.channel.upgrade() {
            let _guard = shared.op_lock.lock().await;
            self.cache.remove(&self.queue, self.id()).await;
        }

        let delivery_tag = incoming.delivery_tag;
        if self.manual_ack() {
            let (acker, settled) = Acknowledger::new(delivery_tag);
            let delivery = Delivery::new(
                self.id(),
                &self.queue,
                incoming.message_id,
                incoming.redelivered,
                payload,
                Some(acker),
            );
            self.consumer.consume(delivery).await;
            settle(self.handle.clone(), self.queue.clone(), delivery_tag, settled).await;
            self.cancel(deliveries).await;
        } else {
            if let Err(err) = self.handle.basic_ack(delivery_tag).await {
                // the broker redelivers the message, receive it again after the reconnect
                warn!(queue = %self.queue, id = self.id(), "ack failed, receive stays pending: {}", err);
                if let Err(err) = self.cache.store(&self.queue, self.operation.clone()).await {
                    warn!(queue = %self.queue, id = self.id(), "receive lost: {}", err);
                }
                self.cancel(deliveries).await;
                return;
            }
            self.cancel(deliveries).await;
            let delivery = Delivery::new(
                self.id(),
                &self.queue,
                incoming.message_id,
                incoming.redelivered,
                payload,
                None,
            );
            self.consumer.consume(delivery).await;
        }
        trace!(queue = %self.queue, id = self.id(), "exit receiver");
    }

    async fn cancel(&self, deliveries: mpsc::UnboundedReceiver<IncomingDelivery>) {
        if let Err(err) = self.handle.basic_cancel(self.id()).await {
            debug!(queue = %self.queue, id = self.id(), "cancel failed: {}", err);
        }
        self.release();
        self.drain(deliveries).await;
    }

    /// Requeue deliveries that raced the cancel, until the broker ends the consumer.
    async fn drain(&self, mut deliveries: mpsc::UnboundedReceiver<IncomingDelivery>) {
        while let Some(extra) = deliveries.recv().await {
            self.requeue(extra.delivery_tag).await;
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::{BasicConsumeArguments, BasicPublishArguments, MessageProperties};

    #[test]
    fn test_publish_arguments_route_by_queue() {
        let args = BasicPublishArguments::new("_default_-jobs")
            .mandatory(true)
            .finish();
        assert_eq!("", args.exchange);
        assert_eq!("_default_-jobs", args.routing_key);
        assert!(args.mandatory);
    }

    #[test]
    fn test_builders() {
        let properties = MessageProperties::default()
            .message_id("m1")
            .timestamp(42)
            .persistent(true)
            .finish();
        assert_eq!(Some("m1".to_string()), properties.message_id);
        assert_eq!(Some(42), properties.timestamp);
        assert!(properties.persistent);
        assert_eq!(None, properties.app_id);

        let args = BasicConsumeArguments::new("q", "tag").no_ack(true).finish();
        assert!(args.no_ack);
        assert_eq!("tag", args.consumer_tag);
    }
}
