//! Broker client seam.
//!
//! The wire protocol is not implemented in this crate. A broker client is plugged in behind the
//! three traits below: [`Broker`] opens connections, [`BrokerConnection`] opens channels and
//! reports connection failures, and [`BrokerChannel`] performs queue and basic methods.
//!
//! Broker-level channel events travel back to the owning [`Channel`](crate::Channel) through the
//! [`SignalSink`] handed to [`BrokerConnection::open_channel`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    channel::{BasicConsumeArguments, BasicPublishArguments, MessageProperties, QueueDeclareArguments},
    error::Error,
    Result,
};

mod memory;
mod rabbitmq;

pub use memory::MemoryBroker;
pub use rabbitmq::LapinBroker;

/////////////////////////////////////////////////////////////////////////////
/// Arguments to open a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectArguments {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Heartbeat interval in seconds, `0` disables heartbeats.
    pub heartbeat: u16,
    pub connection_name: Option<String>,
}

impl Default for ConnectArguments {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5672,
            username: String::from("guest"),
            password: String::from("guest"),
            virtual_host: String::from("/"),
            heartbeat: 30,
            connection_name: None,
        }
    }
}

impl ConnectArguments {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_owned(),
            port,
            username: username.to_owned(),
            password: password.to_owned(),
            ..Default::default()
        }
    }

    pub fn virtual_host(&mut self, virtual_host: &str) -> &mut Self {
        self.virtual_host = virtual_host.to_owned();
        self
    }

    pub fn heartbeat(&mut self, heartbeat: u16) -> &mut Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn connection_name(&mut self, connection_name: &str) -> &mut Self {
        self.connection_name = Some(connection_name.to_owned());
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}

/////////////////////////////////////////////////////////////////////////////
/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub content: Vec<u8>,
}

/// A mandatory message the broker could not route and sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub queue: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub message_id: Option<String>,
    pub content: Vec<u8>,
}

/// Channel level events raised by a broker client.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Error(Error),
    Return(ReturnedMessage),
    Closed,
}

/// Sender half for [`ChannelSignal`]s, tagged with the generation of the channel handle it was
/// created for.
#[derive(Debug, Clone)]
pub struct SignalSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, ChannelSignal)>,
}

impl SignalSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, ChannelSignal)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn error(&self, err: Error) {
        self.emit(ChannelSignal::Error(err));
    }

    pub fn returned(&self, message: ReturnedMessage) {
        self.emit(ChannelSignal::Return(message));
    }

    pub fn closed(&self) {
        self.emit(ChannelSignal::Closed);
    }

    fn emit(&self, signal: ChannelSignal) {
        // the owning channel is gone, nobody to tell
        let _ = self.tx.send((self.generation, signal));
    }
}

/// Invoked at most once, when a live connection fails.
pub type ConnectionErrorHandler = Box<dyn FnOnce(Error) + Send + 'static>;

/////////////////////////////////////////////////////////////////////////////
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, args: &ConnectArguments) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self, signals: SignalSink) -> Result<Arc<dyn BrokerChannel>>;

    /// Register the handler for connection failure. A later registration replaces the former.
    /// A failure before the registration is not reported, check [`is_open`](Self::is_open) after.
    fn on_error(&self, handler: ConnectionErrorHandler);

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn queue_declare(&self, args: &QueueDeclareArguments) -> Result<()>;

    async fn queue_delete(&self, queue: &str) -> Result<()>;

    /// Publish to the default exchange, routed by queue name.
    /// An unroutable mandatory message is reported through [`SignalSink::returned`].
    async fn basic_publish(
        &self,
        args: &BasicPublishArguments,
        properties: &MessageProperties,
        content: Vec<u8>,
    ) -> Result<()>;

    /// Register a consumer. The receiver ends when the consumer is cancelled or the channel closes.
    async fn basic_consume(
        &self,
        args: &BasicConsumeArguments,
    ) -> Result<mpsc::UnboundedReceiver<IncomingDelivery>>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
