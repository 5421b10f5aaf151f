//! In-process broker, registered under the `memory` type key.
//!
//! Queues live in memory, consumers are served round-robin, unacked deliveries are requeued when
//! their channel closes. Connection and channel failures can be injected, which makes it the
//! broker of choice for tests and demos without a RabbitMQ server.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    Broker, BrokerChannel, BrokerConnection, ConnectArguments, ConnectionErrorHandler,
    IncomingDelivery, ReturnedMessage, SignalSink,
};
use crate::{
    channel::{BasicConsumeArguments, BasicPublishArguments, MessageProperties, QueueDeclareArguments},
    error::Error,
    Result,
};

const REPLY_NO_ROUTE: u16 = 312;

/////////////////////////////////////////////////////////////////////////////
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    reject_publishes: bool,
    next_id: u64,
    next_delivery_tag: u64,
    connect_attempts: usize,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, Unacked>,
    consume_history: Vec<(String, String)>,
    publish_history: Vec<(String, Option<String>)>,
}

struct ConnectionEntry {
    open: Arc<AtomicBool>,
    error_handler: Option<ConnectionErrorHandler>,
}

struct ChannelEntry {
    connection_id: u64,
    open: Arc<AtomicBool>,
    signals: SignalSink,
}

#[derive(Default)]
struct MemoryQueue {
    arguments: Option<QueueDeclareArguments>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: Option<String>,
    content: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<IncomingDelivery>,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Push ready messages of a queue to its consumers.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = index + 1;

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let consumer = &queue.consumers[index];
            let incoming = IncomingDelivery {
                delivery_tag,
                message_id: message.message_id.clone(),
                redelivered: message.redelivered,
                content: message.content.clone(),
            };
            if consumer.tx.send(incoming).is_err() {
                // receiver is gone, forget the consumer and keep the message
                queue.consumers.remove(index);
                queue.messages.push_front(message);
                continue;
            }
            trace!(queue = queue_name, delivery_tag, "memory broker delivered message");
            if !consumer.no_ack {
                let channel_id = consumer.channel_id;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        channel_id,
                        message,
                    },
                );
            }
        }
    }

    fn requeue(&mut self, delivery_tags: Vec<u64>) {
        let mut touched = Vec::new();
        // front-insert in reverse, so requeued messages keep their order
        for tag in delivery_tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                    if !touched.contains(&unacked.queue) {
                        touched.push(unacked.queue);
                    }
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if let Some(entry) = self.channels.remove(&channel_id) {
            entry.open.store(false, Ordering::Relaxed);
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        self.requeue(tags);
    }

    /// Close a connection with all its channels, handing back its error handler.
    fn close_connection(&mut self, connection_id: u64) -> Option<ConnectionErrorHandler> {
        let entry = self.connections.remove(&connection_id)?;
        entry.open.store(false, Ordering::Relaxed);
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id);
        }
        entry.error_handler
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable, every connect attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// While set, every publish fails with a channel error and is not routed.
    pub fn reject_publishes(&self, reject: bool) {
        self.state().reject_publishes = reject;
    }

    /// Fail every open connection, as a network outage would.
    /// Returns the number of connections dropped.
    pub fn drop_connections(&self) -> usize {
        let handlers: Vec<Option<ConnectionErrorHandler>> = {
            let mut state = self.state();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .map(|id| state.close_connection(id))
                .collect()
        };
        let count = handlers.len();
        debug!(count, "memory broker dropped connections");
        // handlers run outside the lock, they may call back into the broker
        for handler in handlers.into_iter().flatten() {
            handler(Error::NetworkError("connection reset by peer".to_string()));
        }
        count
    }

    /// Close every open channel from the broker side, raising `error` and `close` on each.
    pub fn fail_channels(&self) -> usize {
        let mut state = self.state();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in &ids {
            if let Some(entry) = state.channels.get(id) {
                entry.signals.error(Error::ChannelUseError(
                    "CHANNEL_ERROR - channel closed by broker".to_string(),
                ));
                entry.signals.closed();
            }
            state.close_channel(*id);
        }
        ids.len()
    }

    /// Delete a queue behind the back of its channels, dropping its messages and consumers.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.state();
        state.unacked.retain(|_, u| u.queue != queue);
        state.queues.remove(queue).is_some()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Arguments of the last declaration of a queue.
    pub fn queue_arguments(&self, queue: &str) -> Option<QueueDeclareArguments> {
        self.state()
            .queues
            .get(queue)
            .and_then(|q| q.arguments.clone())
    }

    /// Number of ready messages of a queue, unacked ones are not counted.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    /// Tags of the consumers currently registered on a queue.
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Every consumer tag ever registered on a queue, in registration order.
    pub fn consume_history(&self, queue: &str) -> Vec<String> {
        self.state()
            .consume_history
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, tag)| tag.clone())
            .collect()
    }

    /// Message ids of every publish routed by queue name, in publish order.
    pub fn publish_history(&self, queue: &str) -> Vec<Option<String>> {
        self.state()
            .publish_history
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, args: &ConnectArguments) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(Error::ConnectionOpenError(format!(
                "connection refused: {}:{}",
                args.host, args.port
            )));
        }
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            ConnectionEntry {
                open: open.clone(),
                error_handler: None,
            },
        );
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            open,
        }))
    }
}

/////////////////////////////////////////////////////////////////////////////
struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self, signals: SignalSink) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(Error::NetworkError(format!(
                "connection {} is closed",
                self.id
            )));
        }
        let mut state = self.broker.state();
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.id,
                open: open.clone(),
                signals: signals.clone(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            open,
            signals,
        }))
    }

    fn on_error(&self, handler: ConnectionErrorHandler) {
        if let Some(entry) = self.broker.state().connections.get_mut(&self.id) {
            entry.error_handler = Some(handler);
        }
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::Relaxed) {
            // a graceful close does not raise the error handler
            let _handler = self.broker.state().close_connection(self.id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/////////////////////////////////////////////////////////////////////////////
struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
    signals: SignalSink,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::NetworkError(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn queue_declare(&self, args: &QueueDeclareArguments) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.queues.entry(args.queue.clone()).or_default().arguments = Some(args.clone());
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.queues.remove(queue);
        state.unacked.retain(|_, u| u.queue != queue);
        Ok(())
    }

    async fn basic_publish(
        &self,
        args: &BasicPublishArguments,
        properties: &MessageProperties,
        content: Vec<u8>,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.state();
        if state.reject_publishes {
            return Err(Error::ChannelUseError(format!(
                "RESOURCE_ERROR - publish to '{}' rejected",
                args.routing_key
            )));
        }
        state
            .publish_history
            .push((args.routing_key.clone(), properties.message_id.clone()));
        match state.queues.get_mut(&args.routing_key) {
            Some(queue) => {
                queue.messages.push_back(StoredMessage {
                    message_id: properties.message_id.clone(),
                    content,
                    redelivered: false,
                });
                state.dispatch(&args.routing_key);
            }
            None if args.mandatory => {
                self.signals.returned(ReturnedMessage {
                    queue: args.routing_key.clone(),
                    reply_code: REPLY_NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    message_id: properties.message_id.clone(),
                    content,
                });
            }
            None => {}
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        args: &BasicConsumeArguments,
    ) -> Result<mpsc::UnboundedReceiver<IncomingDelivery>> {
        self.check_open()?;
        let mut state = self.broker.state();
        let in_use = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .any(|c| c.channel_id == self.id && c.tag == args.consumer_tag);
        if in_use {
            return Err(Error::ChannelUseError(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                args.consumer_tag
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = state.queues.get_mut(&args.queue).ok_or_else(|| {
            Error::ChannelUseError(format!("NOT_FOUND - no queue '{}'", args.queue))
        })?;
        queue.consumers.push(ConsumerEntry {
            tag: args.consumer_tag.clone(),
            channel_id: self.id,
            no_ack: args.no_ack,
            tx,
        });
        state
            .consume_history
            .push((args.queue.clone(), args.consumer_tag.clone()));
        state.dispatch(&args.queue);
        Ok(rx)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.state();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.state();
        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => {
                state.unacked.remove(&delivery_tag);
                Ok(())
            }
            _ => Err(Error::ChannelUseError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.state();
        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => {
                if requeue {
                    state.requeue(vec![delivery_tag]);
                } else {
                    state.unacked.remove(&delivery_tag);
                }
                Ok(())
            }
            _ => Err(Error::ChannelUseError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::Relaxed) {
            self.broker.state().close_channel(self.id);
        }
        Ok(())
    }
}
