//! Resilient channel bound to one queue.
//!
//! A [`Channel`] owns at most one broker channel at a time. Operations are cached before they touch
//! the broker, so they survive a lost connection: the channel re-issues them after the owning
//! [`Instance`] reports `connected` or `reconnected`.
//!
//! To get a channel, use [`Instance::channel`] or [`Registry::channel`].
//!
//! [`Registry::channel`]: crate::Registry::channel
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::{
    cache::{build_cache, OperationKind, PendingCache, PendingRecord},
    config::ChannelConfig,
    error::Error,
    event::Event,
    instance::{Instance, WeakInstance},
    utils::{lock, queue_name},
    Result,
};
use crate::net::{BrokerChannel, ChannelSignal, SignalSink};

const EVENT_CAPACITY: usize = 64;

/////////////////////////////////////////////////////////////////////////////
/// Handle of a resilient channel. Cloning is cheap, clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<SharedChannelInner>,
}

pub(crate) struct SharedChannelInner {
    name: String,
    queue: String,
    config: ChannelConfig,
    instance: WeakInstance,
    cache: Arc<dyn PendingCache>,
    attached: Mutex<Option<Attached>>,
    /// Bumped on every setup attempt and detach. Broker signals and registrations tagged with an
    /// older generation are stale.
    generation: AtomicU64,
    /// Generation of the broker channel the cache was last replayed on.
    replayed: AtomicU64,
    consumers: Mutex<HashMap<String, ConsumerSlot>>,
    next_token: AtomicU64,
    /// Serializes operations and replay.
    op_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<Event>,
    signal_tx: mpsc::UnboundedSender<(u64, ChannelSignal)>,
}

/// The live broker channel.
#[derive(Clone)]
pub(crate) struct Attached {
    generation: u64,
    handle: Arc<dyn BrokerChannel>,
}

/// A consumer registered on the live broker channel.
struct ConsumerSlot {
    token: u64,
    stop: oneshot::Sender<()>,
}

impl Channel {
    /// Must be called within a tokio runtime.
    pub(crate) fn new(instance: &Instance, name: &str, config: ChannelConfig) -> Result<Self> {
        let cache = build_cache(&config.cache)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let channel = Self {
            shared: Arc::new(SharedChannelInner {
                name: name.to_owned(),
                queue: queue_name(instance.name(), name),
                config,
                instance: instance.downgrade(),
                cache,
                attached: Mutex::new(None),
                generation: AtomicU64::new(0),
                replayed: AtomicU64::new(0),
                consumers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                op_lock: tokio::sync::Mutex::new(()),
                events,
                signal_tx,
            }),
        };
        channel.spawn_supervisor(instance.subscribe(), signal_rx);
        debug!(queue = channel.queue(), "channel created");
        Ok(channel)
    }

    fn upgrade(weak: &Weak<SharedChannelInner>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Follow the instance lifecycle and the broker signals of this channel.
    fn spawn_supervisor(
        &self,
        mut instance_events: broadcast::Receiver<Event>,
        mut signals: mpsc::UnboundedReceiver<(u64, ChannelSignal)>,
    ) {
        let weak = Arc::downgrade(&self.shared);
        let queue = self.shared.queue.clone();
        tokio::spawn(async move {
            // the instance may be connected already
            if let Some(channel) = Self::upgrade(&weak) {
                channel.restore().await;
            }
            loop {
                tokio::select! {
                    event = instance_events.recv() => {
                        let Some(channel) = Self::upgrade(&weak) else {
                            break;
                        };
                        match event {
                            Ok(Event::Connected) | Ok(Event::Reconnected) => channel.restore().await,
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(queue = %queue, skipped, "channel lagged behind instance events");
                                channel.restore().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    signal = signals.recv() => {
                        let Some((generation, signal)) = signal else {
                            break;
                        };
                        let Some(channel) = Self::upgrade(&weak) else {
                            break;
                        };
                        channel.handle_signal(generation, signal).await;
                    }
                }
            }
            trace!(queue = %queue, "exit channel supervisor");
        });
    }

    /// Channel name within its instance.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Broker queue name, `"{instance}-{channel}"`.
    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn instance(&self) -> Option<Instance> {
        self.shared.instance.upgrade()
    }

    /// `true` if a broker channel is open.
    pub fn ready(&self) -> bool {
        lock(&self.shared.attached).is_some()
    }

    /// `true` if a consumer is registered under `id` on the open broker channel.
    pub fn is_consuming(&self, id: &str) -> bool {
        lock(&self.shared.consumers).contains_key(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Operations currently cached for this queue, in replay order.
    pub async fn pending(&self) -> Vec<PendingRecord> {
        self.shared
            .cache
            .get(self.queue())
            .await
            .into_iter()
            .map(|operation| operation.record)
            .collect()
    }

    fn emit(&self, event: Event) {
        // no subscriber is not an error
        let _ = self.shared.events.send(event);
    }

    fn report_error(&self, err: Error) {
        self.emit(Event::Error {
            source: self.queue().to_owned(),
            error: err.clone(),
        });
        if let Some(instance) = self.instance() {
            instance.emit(Event::Error {
                source: self.queue().to_owned(),
                error: err,
            });
        }
    }

    /// Open a broker channel and declare the queue, unless one is open already.
    /// Caller holds `op_lock`.
    pub(crate) async fn setup_locked(&self) -> Result<Attached> {
        if let Some(attached) = lock(&self.shared.attached).clone() {
            return Ok(attached);
        }
        let instance = self.instance().ok_or_else(|| {
            Error::NotConnected(format!("instance of {} is gone", self.queue()))
        })?;
        let connection = instance.connection().ok_or_else(|| {
            Error::NotConnected(format!("instance {} is not connected yet", instance.name()))
        })?;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = SignalSink::new(generation, self.shared.signal_tx.clone());
        let handle = connection.open_channel(sink).await?;
        let args = QueueDeclareArguments::from_config(self.queue(), &self.shared.config.queue);
        if let Err(err) = handle.queue_declare(&args).await {
            self.close_quietly(&handle).await;
            return Err(err);
        }

        let attached = Attached { generation, handle };
        let installed = {
            let mut current = lock(&self.shared.attached);
            if self.shared.generation.load(Ordering::SeqCst) == generation {
                *current = Some(attached.clone());
                true
            } else {
                false
            }
        };
        if !installed {
            self.close_quietly(&attached.handle).await;
            return Err(Error::NotConnected(format!(
                "connection of {} dropped during setup",
                self.queue()
            )));
        }
        debug!(queue = self.queue(), generation, "channel ready");
        Ok(attached)
    }

    async fn close_quietly(&self, handle: &Arc<dyn BrokerChannel>) {
        if let Err(err) = handle.close().await {
            debug!(queue = self.queue(), "close broker channel: {}", err);
        }
    }

    /// Set up the channel, then re-issue every cached operation once per broker channel.
    ///
    /// One reconnect raises both `connected` and `reconnected`, the second pass only checks the
    /// setup. Entries whose re-issue failed wait for the next broker channel.
    pub(crate) async fn restore(&self) {
        let _guard = self.shared.op_lock.lock().await;
        match self.setup_locked().await {
            Ok(attached) => {
                let previous = self.shared.replayed.swap(attached.generation, Ordering::SeqCst);
                if previous == attached.generation {
                    trace!(queue = self.queue(), "already replayed on this channel");
                } else {
                    self.replay_locked().await;
                }
            }
            Err(err) if err.is_transient() => {
                debug!(queue = self.queue(), "channel not set up: {}", err)
            }
            Err(err) => {
                error!(queue = self.queue(), "channel setup failed: {}", err);
                self.report_error(err);
            }
        }
    }

    /// Re-issue cached operations under their original ids. Each entry leaves the cache before it
    /// is re-issued; the re-issued operation caches itself again until it is done.
    async fn replay_locked(&self) {
        let operations = self.shared.cache.get(self.queue()).await;
        if operations.is_empty() {
            return;
        }
        info!(
            queue = self.queue(),
            count = operations.len(),
            "replay pending operations"
        );
        for operation in operations {
            let id = operation.id().to_owned();
            let kind = operation.kind();
            if kind != OperationKind::Send && self.is_consuming(&id) {
                trace!(queue = self.queue(), id = %id, "consumer is live, skip replay");
                continue;
            }
            self.shared.cache.remove(self.queue(), &id).await;
            if kind != OperationKind::Send && operation.consumer.is_none() {
                warn!(
                    queue = self.queue(),
                    id = %id,
                    "drop {} registered by a previous process, its consumer is gone",
                    kind
                );
                continue;
            }
            debug!(queue = self.queue(), id = %id, kind = %kind, "replay operation");
            let outcome = match kind {
                OperationKind::Send => self.send_locked(operation).await,
                OperationKind::Listen | OperationKind::Receive => {
                    self.consume_locked(operation).await
                }
            };
            if let Err(err) = outcome {
                warn!(queue = self.queue(), id = %id, "replay of {} failed: {}", kind, err);
            }
        }
    }

    /// Drop the broker channel and forget its consumers. Cached operations stay.
    pub(crate) fn detach(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let attached = lock(&self.shared.attached).take();
        // dropping a slot stops its consumer task
        let stopped = lock(&self.shared.consumers).drain().count();
        if attached.is_some() {
            debug!(queue = self.queue(), consumers = stopped, "channel detached");
        }
        attached.map(|attached| attached.handle)
    }

    async fn handle_signal(&self, generation: u64, signal: ChannelSignal) {
        let current = generation == self.shared.generation.load(Ordering::SeqCst);
        match signal {
            ChannelSignal::Error(err) => {
                if !current {
                    debug!(queue = self.queue(), "ignore error of stale channel: {}", err);
                    return;
                }
                warn!(queue = self.queue(), "channel error: {}", err);
                self.report_error(err);
            }
            ChannelSignal::Return(message) => {
                warn!(
                    queue = self.queue(),
                    id = ?message.message_id,
                    reply_code = message.reply_code,
                    "message returned: {}",
                    message.reply_text
                );
                self.emit(Event::Return(message.clone()));
                if let Some(instance) = self.instance() {
                    instance.emit(Event::Return(message));
                }
            }
            ChannelSignal::Closed => {
                if !current {
                    return;
                }
                self.detach();
                info!(queue = self.queue(), "channel closed by broker");
                self.emit(Event::Close {
                    channel: self.name().to_owned(),
                });
                // the connection may have survived, re-register consumers on a new channel
                if self.instance().map(|i| i.is_connected()).unwrap_or(false) {
                    self.restore().await;
                }
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
mod basic;
pub use basic::*;
mod queue;
pub use queue::*;
