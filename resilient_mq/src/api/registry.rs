//! Entry point resolving named instances and their channels from configuration.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    callbacks::SendCallback,
    channel::Channel,
    config::{RegistryConfig, DEFAULT_INSTANCE},
    consumer::{AckMode, Consumer},
    error::Error,
    event::Event,
    instance::Instance,
    utils::lock,
    Result,
};
use crate::net::{Broker, LapinBroker};

const EVENT_CAPACITY: usize = 128;

/////////////////////////////////////////////////////////////////////////////
/// Broker clients by type key, the `type` of an instance configuration.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    brokers: HashMap<String, Arc<dyn Broker>>,
}

impl BrokerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `rabbitmq` backed by [`LapinBroker`].
    pub fn with_defaults() -> Self {
        let mut brokers = Self::new();
        brokers.register("rabbitmq", Arc::new(LapinBroker));
        brokers
    }

    pub fn register(&mut self, key: &str, broker: Arc<dyn Broker>) {
        self.brokers.insert(key.to_owned(), broker);
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn Broker>> {
        self.brokers
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("unknown broker type: {}", key)))
    }

    pub fn keys(&self) -> Vec<String> {
        self.brokers.keys().cloned().collect()
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Resolves named [`Instance`]s from a [`RegistryConfig`] and forwards to their channels.
///
/// Instances are built and connected on first use. Cloning is cheap, clones share the instances.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryInner>,
}

struct RegistryInner {
    config: Mutex<RegistryConfig>,
    brokers: Mutex<BrokerRegistry>,
    instances: Mutex<BTreeMap<String, Instance>>,
    events: broadcast::Sender<Event>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(RegistryInner {
                config: Mutex::new(config),
                brokers: Mutex::new(BrokerRegistry::with_defaults()),
                instances: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    pub fn register_broker(&self, key: &str, broker: Arc<dyn Broker>) {
        lock(&self.shared.brokers).register(key, broker);
    }

    /// Replace the configuration, or deep-merge onto it when `merge` is set.
    /// Instances built already keep the configuration they were built with.
    pub fn configure(&self, config: RegistryConfig, merge: bool) {
        let mut current = lock(&self.shared.config);
        if merge {
            current.merge(config);
        } else {
            *current = config;
        }
    }

    pub fn config(&self) -> RegistryConfig {
        lock(&self.shared.config).clone()
    }

    /// Close and drop every instance, then install `config`, or an empty one.
    pub async fn reset(&self, config: Option<RegistryConfig>) {
        let instances: Vec<Instance> = {
            let mut instances = lock(&self.shared.instances);
            std::mem::take(&mut *instances).into_values().collect()
        };
        for instance in instances {
            instance.reset().await;
        }
        *lock(&self.shared.config) = config.unwrap_or_default();
        debug!("registry reset");
    }

    fn default_instance_name(&self) -> String {
        lock(&self.shared.config)
            .default_instance_name()
            .unwrap_or(DEFAULT_INSTANCE)
            .to_owned()
    }

    /// The instance flagged `default`, else the first configured one, else `_default_`.
    pub fn default_instance(&self) -> Result<Instance> {
        self.instance(None)
    }

    /// Get an instance, building and connecting it on first use.
    ///
    /// An unconfigured name resolves to the default configuration. Must be called within a
    /// tokio runtime.
    pub fn instance(&self, name: Option<&str>) -> Result<Instance> {
        let name = match name {
            Some(name) => name.to_owned(),
            None => self.default_instance_name(),
        };
        let mut instances = lock(&self.shared.instances);
        if let Some(instance) = instances.get(&name) {
            return Ok(instance.clone());
        }

        let config = lock(&self.shared.config).resolve(&name)?;
        let broker = lock(&self.shared.brokers).get(&config.broker)?;
        info!(instance = %name, broker = %config.broker, "create instance");
        let instance = Instance::new(&name, config, broker);
        self.forward_errors(&instance);
        instances.insert(name, instance.clone());

        let connecting = instance.clone();
        tokio::spawn(async move {
            if let Err(err) = connecting.connect().await {
                debug!(instance = connecting.name(), "first connect failed: {}", err);
            }
        });
        Ok(instance)
    }

    pub fn instances(&self) -> Vec<Instance> {
        lock(&self.shared.instances).values().cloned().collect()
    }

    fn forward_errors(&self, instance: &Instance) {
        let mut events = instance.subscribe();
        let forward = self.shared.events.clone();
        let name = instance.name().to_owned();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event @ Event::Error { .. }) => {
                        let _ = forward.send(event);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(instance = %name, skipped, "registry lagged behind instance events")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// `error` events of every instance.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// `true` if every instance built so far is ready, so also before the first one is built.
    pub fn ready(&self) -> bool {
        self.instances().iter().all(Instance::ready)
    }

    /// Get the channel `name` of an instance, the default one if `None`.
    pub fn channel(&self, name: &str, instance: Option<&str>) -> Result<Channel> {
        self.instance(instance)?.channel(name)
    }

    /// [`Channel::send`] on the channel `queue` of the default instance.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        callback: Option<SendCallback>,
        id: Option<String>,
    ) -> Result<String> {
        self.channel(queue, None)?.send(payload, callback, id).await
    }

    /// [`Channel::receive`] on the channel `queue` of the default instance.
    pub async fn receive(
        &self,
        queue: &str,
        ack_mode: AckMode,
        consumer: Arc<dyn Consumer>,
        id: Option<String>,
    ) -> Result<String> {
        self.channel(queue, None)?.receive(ack_mode, consumer, id).await
    }

    /// [`Channel::listen`] on the channel `queue` of the default instance.
    pub async fn listen(
        &self,
        queue: &str,
        ack_mode: AckMode,
        consumer: Arc<dyn Consumer>,
        id: Option<String>,
    ) -> Result<String> {
        self.channel(queue, None)?.listen(ack_mode, consumer, id).await
    }

    /// [`Channel::unlisten`] on the channel `queue` of the default instance.
    pub async fn unlisten(&self, queue: &str, id: &str) -> Result<()> {
        self.channel(queue, None)?.unlisten(id).await
    }
}
