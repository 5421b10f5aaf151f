//! Broker instance: one connection and the channels built on it.
//!
//! The instance connects on [`Instance::connect`], retries failed attempts after a fixed
//! interval, and turns a failure of the live connection into `error`, `interrupted`,
//! `disconnected`, then a delayed reconnect which emits `connected` and `reconnected`.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{
    callbacks::InstanceCallback, channel::Channel, config::InstanceConfig, error::Error,
    event::Event, utils::lock, Result,
};
use crate::net::{Broker, BrokerConnection, ConnectionErrorHandler};

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Handle of a broker instance. Cloning is cheap, clones share the same connection.
#[derive(Clone)]
pub struct Instance {
    shared: Arc<SharedInstanceInner>,
}

struct SharedInstanceInner {
    name: String,
    config: InstanceConfig,
    broker: Arc<dyn Broker>,
    state: Mutex<ConnectionState>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    /// Identifies the current connection, error reports of older ones are ignored.
    connection_seq: AtomicU64,
    interrupted: AtomicBool,
    /// Set by `close`, stops scheduled reconnects.
    stopped: AtomicBool,
    failed_attempts: AtomicU32,
    channels: Mutex<BTreeMap<String, Channel>>,
    events: broadcast::Sender<Event>,
}

/// Non-owning reference held by channels.
#[derive(Clone)]
pub(crate) struct WeakInstance(Weak<SharedInstanceInner>);

impl WeakInstance {
    pub(crate) fn upgrade(&self) -> Option<Instance> {
        self.0.upgrade().map(|shared| Instance { shared })
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Instance {
    /// A new, disconnected instance. Call [`connect`](Instance::connect) to open the connection.
    pub fn new(name: &str, config: InstanceConfig, broker: Arc<dyn Broker>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(SharedInstanceInner {
                name: name.to_owned(),
                config,
                broker,
                state: Mutex::new(ConnectionState::Disconnected),
                connection: Mutex::new(None),
                connection_seq: AtomicU64::new(0),
                interrupted: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                failed_attempts: AtomicU32::new(0),
                channels: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakInstance {
        WeakInstance(Arc::downgrade(&self.shared))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.shared.state) = state;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.connection).is_some()
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        lock(&self.shared.connection).clone()
    }

    /// `true` if connected and every channel has an open broker channel.
    pub fn ready(&self) -> bool {
        self.is_connected() && self.channels().iter().all(Channel::ready)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        // no subscriber is not an error
        let _ = self.shared.events.send(event);
    }

    /// Spawn a task handing every event of this instance to `callback`.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: InstanceCallback + 'static,
    {
        let mut events = self.subscribe();
        let weak = self.downgrade();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(instance) = weak.upgrade() else {
                            break;
                        };
                        callback.on_event(&instance, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "instance callback lagged behind events")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /////////////////////////////////////////////////////////////////////////
    /// Get the channel `name`, creating it on first use from the channel configuration.
    ///
    /// Must be called within a tokio runtime.
    pub fn channel(&self, name: &str) -> Result<Channel> {
        let mut channels = lock(&self.shared.channels);
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }
        let channel = Channel::new(self, name, self.shared.config.channel(name))?;
        channels.insert(name.to_owned(), channel.clone());
        Ok(channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.shared.channels).values().cloned().collect()
    }

    /////////////////////////////////////////////////////////////////////////
    /// Open the broker connection. A no-op while connecting or connected.
    ///
    /// A failed attempt emits `error` and schedules another one after `reconnect.interval_ms`.
    pub async fn connect(&self) -> Result<()> {
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.try_connect().await
    }

    async fn try_connect(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }

        let args = self.shared.config.client.connect_arguments(self.name());
        debug!(instance = self.name(), host = %args.host, port = args.port, "connecting");
        let connection = match self.shared.broker.connect(&args).await {
            Ok(connection) => connection,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(instance = self.name(), "connection failed: {}", err);
                self.emit(Event::Error {
                    source: self.name().to_owned(),
                    error: err.clone(),
                });
                self.schedule_reconnect();
                return Err(err);
            }
        };

        if self.shared.stopped.load(Ordering::SeqCst) {
            // closed while connecting
            if let Err(err) = connection.close().await {
                debug!(instance = self.name(), "close: {}", err);
            }
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        let seq = self.shared.connection_seq.fetch_add(1, Ordering::SeqCst) + 1;
        connection.on_error(self.error_handler(seq));
        *lock(&self.shared.connection) = Some(connection.clone());
        self.set_state(ConnectionState::Connected);
        if !connection.is_open() {
            // failed before the handler was registered, nothing else reports it
            let err = Error::NetworkError(format!(
                "connection of {} closed while opening",
                self.name()
            ));
            self.interrupt(seq, err.clone()).await;
            return Err(err);
        }
        self.shared.failed_attempts.store(0, Ordering::SeqCst);
        info!(instance = self.name(), "connected to {}:{}", args.host, args.port);

        self.emit(Event::Connected);
        if self.shared.interrupted.swap(false, Ordering::SeqCst) {
            info!(instance = self.name(), "reconnected");
            self.emit(Event::Reconnected);
        }

        for name in self.shared.config.channels.keys() {
            if let Err(err) = self.channel(name) {
                error!(instance = self.name(), channel = %name, "channel setup failed: {}", err);
                self.emit(Event::Error {
                    source: self.name().to_owned(),
                    error: err,
                });
            }
        }
        Ok(())
    }

    /// Handler for a failure of the connection numbered `seq`, run on the current runtime.
    fn error_handler(&self, seq: u64) -> ConnectionErrorHandler {
        let weak = self.downgrade();
        let runtime = tokio::runtime::Handle::current();
        Box::new(move |err| {
            if let Some(instance) = weak.upgrade() {
                runtime.spawn(async move { instance.interrupt(seq, err).await });
            }
        })
    }

    fn schedule_reconnect(&self) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let failed = self.shared.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let reconnect = &self.shared.config.reconnect;
        if let Some(max_attempts) = reconnect.max_attempts {
            if failed > max_attempts {
                error!(
                    instance = self.name(),
                    attempts = failed - 1,
                    "giving up reconnecting"
                );
                return;
            }
        }
        let delay = Duration::from_millis(reconnect.interval_ms);
        debug!(instance = self.name(), ?delay, "reconnect scheduled");
        let weak = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(instance) = weak.upgrade() {
                if let Err(err) = instance.try_connect().await {
                    debug!(instance = instance.name(), "reconnect attempt failed: {}", err);
                }
            }
        });
    }

    /// Handle a failure of the connection numbered `seq`, at most once per connection.
    async fn interrupt(&self, seq: u64, err: Error) {
        {
            let mut state = lock(&self.shared.state);
            if seq != self.shared.connection_seq.load(Ordering::SeqCst)
                || *state != ConnectionState::Connected
            {
                debug!(instance = self.name(), "ignore error of stale connection: {}", err);
                return;
            }
            *state = ConnectionState::Interrupted;
        }
        warn!(instance = self.name(), "connection interrupted: {}", err);
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.emit(Event::Error {
            source: self.name().to_owned(),
            error: err,
        });
        self.emit(Event::Interrupted);
        self.disconnect().await;
        self.schedule_reconnect();
    }

    /// Close the connection and detach every channel. Channels keep their cached operations and
    /// set up again on the next `connected`. A no-op without a connection.
    pub async fn disconnect(&self) {
        let connection = lock(&self.shared.connection).take();
        let Some(connection) = connection else {
            return;
        };
        // errors of the closing connection are not interruptions
        self.shared.connection_seq.fetch_add(1, Ordering::SeqCst);
        for channel in self.channels() {
            channel.detach();
        }
        if let Err(err) = connection.close().await {
            debug!(instance = self.name(), "close: {}", err);
        }
        self.set_state(ConnectionState::Disconnected);
        info!(instance = self.name(), "disconnected");
        self.emit(Event::Disconnected);
    }

    /// Disconnect and stop reconnecting until the next [`connect`](Instance::connect).
    pub async fn close(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    /// Close and drop every channel.
    pub async fn reset(&self) {
        self.close().await;
        lock(&self.shared.channels).clear();
        debug!(instance = self.name(), "instance reset");
    }
}
