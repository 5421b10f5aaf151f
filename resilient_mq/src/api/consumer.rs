//! Message delivery to user code.
//!
//! [`Channel::listen`] and [`Channel::receive`] hand each message to a [`Consumer`] as a
//! [`Delivery`]. In [`AckMode::ManualAck`] the delivery carries an [`Acknowledger`] which must be
//! settled once.
//!
//! [`Channel::listen`]: crate::Channel::listen
//! [`Channel::receive`]: crate::Channel::receive
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{error::Error, Result};

/// Who confirms a delivery to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The broker does not wait for a confirmation.
    #[default]
    AutoAck,
    /// The consumer settles every delivery through its [`Acknowledger`].
    ManualAck,
}

/////////////////////////////////////////////////////////////////////////////
/// One-shot acknowledgment continuation of a [`AckMode::ManualAck`] delivery.
///
/// All methods take `self`, so a delivery is settled at most once. Dropping it unsettled
/// rejects the message back to the queue.
#[derive(Debug)]
pub struct Acknowledger {
    delivery_tag: u64,
    tx: Option<oneshot::Sender<bool>>,
}

impl Acknowledger {
    pub(crate) fn new(delivery_tag: u64) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                delivery_tag,
                tx: Some(tx),
            },
            rx,
        )
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Confirm the message.
    pub fn ack(self) {
        self.settle(true);
    }

    /// Reject the message and requeue it.
    pub fn nack(self) {
        self.settle(false);
    }

    pub fn settle(mut self, ack: bool) {
        if let Some(tx) = self.tx.take() {
            if tx.send(ack).is_err() {
                // channel went away, the broker redelivers on its own
                debug!(
                    delivery_tag = self.delivery_tag,
                    "delivery settled after its channel closed"
                );
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/// A message delivered to a [`Consumer`].
#[derive(Debug)]
pub struct Delivery {
    id: String,
    queue: String,
    message_id: Option<String>,
    redelivered: bool,
    payload: serde_json::Value,
    acker: Option<Acknowledger>,
}

impl Delivery {
    pub(crate) fn new(
        id: &str,
        queue: &str,
        message_id: Option<String>,
        redelivered: bool,
        payload: serde_json::Value,
        acker: Option<Acknowledger>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            queue: queue.to_owned(),
            message_id,
            redelivered,
            payload,
            acker,
        }
    }

    /// Id of the `listen`/`receive` operation this delivery belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Id the message was published with, i.e. the id returned by `send`.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    /// The acknowledgment continuation, present once for manual-ack deliveries.
    pub fn take_acker(&mut self) -> Option<Acknowledger> {
        self.acker.take()
    }
}

/////////////////////////////////////////////////////////////////////////////
/// User callback of `listen` and `receive`.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, delivery: Delivery);

    /// Failure of the operation registered under `id`. Transient errors are retried by the
    /// channel once the connection is back.
    async fn error(&self, id: &str, err: &Error) {
        warn!(id, "consumer error: {}", err);
    }
}

/// Logs every delivery and acks it when manual ack is requested.
#[derive(Debug, Default)]
pub struct DefaultConsumer;

impl DefaultConsumer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Consumer for DefaultConsumer {
    async fn consume(&self, mut delivery: Delivery) {
        info!(
            id = delivery.id(),
            queue = delivery.queue(),
            "consume delivery {}",
            delivery.payload()
        );
        if let Some(acker) = delivery.take_acker() {
            acker.ack();
        }
    }
}
