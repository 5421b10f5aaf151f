//! Layered configuration.
//!
//! A [`RegistryConfig`] holds one partial overlay per named instance. Overlays are deep-merged
//! onto [`InstanceConfig::default`] once, when the instance is built, by [`InstanceConfig::resolve`].
//! Per-channel overlays merge onto the instance's `channel_defaults` the same way.
//!
//! ```toml
//! [instances._default_]
//! type = "rabbitmq"
//! client = { host = "rabbit.local", user = "queue-client", pass = "secret" }
//! reconnect = { interval_ms = 500 }
//!
//! [instances._default_.channels.uploads]
//! cache = { type = "file", path = "queues" }
//! queue = { message_ttl = 3600000 }
//! ```
use std::{collections::BTreeMap, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{error::Error, Result};
use crate::net::ConnectArguments;

/// Name of the instance used when none is given.
pub const DEFAULT_INSTANCE: &str = "_default_";

/////////////////////////////////////////////////////////////////////////////
/// Unresolved configuration of every named instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub instances: BTreeMap<String, Value>,
}

impl RegistryConfig {
    pub fn from_json_value(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|err| Error::ConfigError(err.to_string()))?;
        if let Some((name, _)) = config.instances.iter().find(|(_, v)| !v.is_object()) {
            return Err(Error::ConfigError(format!(
                "configuration of instance {} is not a table",
                name
            )));
        }
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let value: Value = toml::from_str(s)?;
        Self::from_json_value(value)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::ConfigError(format!("read {}: {}", path.display(), err)))?;
        Self::from_toml_str(&content)
    }

    /// Add the instance `name` with the given overlay, replacing an existing one.
    pub fn with_instance(mut self, name: &str, overlay: Value) -> Self {
        self.instances.insert(name.to_owned(), overlay);
        self
    }

    /// Deep-merge `other` onto this configuration.
    pub fn merge(&mut self, other: RegistryConfig) {
        for (name, overlay) in other.instances {
            match self.instances.get_mut(&name) {
                Some(existing) => deep_merge(existing, overlay),
                None => {
                    self.instances.insert(name, overlay);
                }
            }
        }
    }

    /// The instance flagged `default = true`, else the first configured one by name.
    pub fn default_instance_name(&self) -> Option<&str> {
        self.instances
            .iter()
            .find(|(_, overlay)| overlay.get("default").and_then(Value::as_bool) == Some(true))
            .or_else(|| self.instances.iter().next())
            .map(|(name, _)| name.as_str())
    }

    pub fn resolve(&self, name: &str) -> Result<InstanceConfig> {
        InstanceConfig::resolve(self.instances.get(name).cloned().unwrap_or(Value::Null))
    }
}

/// Merge `overlay` into `base`: tables merge key by key, anything else replaces. A `null` overlay
/// leaves `base` untouched.
pub(crate) fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None if value.is_null() => {}
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Fully resolved configuration of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Broker type key, see [`BrokerRegistry`](crate::registry::BrokerRegistry).
    #[serde(rename = "type")]
    pub broker: String,
    pub default: bool,
    pub app_id: Option<String>,
    pub client: ClientConfig,
    pub reconnect: ReconnectConfig,
    pub channel_defaults: ChannelConfig,
    /// Channels set up as soon as the instance connects.
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            broker: String::from("rabbitmq"),
            default: false,
            app_id: None,
            client: ClientConfig::default(),
            reconnect: ReconnectConfig::default(),
            channel_defaults: ChannelConfig::default(),
            channels: BTreeMap::new(),
        }
    }
}

impl InstanceConfig {
    /// Merge a partial overlay onto the defaults. Channel overlays merge onto `channel_defaults`.
    pub fn resolve(overlay: Value) -> Result<Self> {
        let mut overlay = overlay;
        let channel_overlays = match overlay.as_object_mut() {
            Some(table) => table.remove("channels"),
            None => None,
        };

        let mut merged = serde_json::to_value(Self::default())?;
        deep_merge(&mut merged, overlay);
        let mut config: Self =
            serde_json::from_value(merged).map_err(|err| Error::ConfigError(err.to_string()))?;
        if config.channel_defaults.message.app_id.is_none() {
            config.channel_defaults.message.app_id = config.app_id.clone();
        }

        let defaults = serde_json::to_value(&config.channel_defaults)?;
        match channel_overlays {
            None | Some(Value::Null) => {}
            Some(Value::Object(channels)) => {
                for (name, channel_overlay) in channels {
                    let mut merged = defaults.clone();
                    deep_merge(&mut merged, channel_overlay);
                    let channel = serde_json::from_value(merged).map_err(|err| {
                        Error::ConfigError(format!("channel {}: {}", name, err))
                    })?;
                    config.channels.insert(name, channel);
                }
            }
            Some(_) => {
                return Err(Error::ConfigError(
                    "channels must be a table of channel configurations".to_string(),
                ))
            }
        }
        Ok(config)
    }

    /// Configuration of a channel, the defaults for unconfigured ones.
    pub fn channel(&self, name: &str) -> ChannelConfig {
        self.channels
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.channel_defaults.clone())
    }
}

/////////////////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Seconds, `0` disables heartbeats.
    pub heartbeat: u16,
    pub vhost: String,
    pub connection_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5672,
            user: String::from("guest"),
            pass: String::from("guest"),
            heartbeat: 30,
            vhost: String::from("/"),
            connection_name: None,
        }
    }
}

impl ClientConfig {
    /// Connection arguments, named after the instance unless a name is configured.
    pub fn connect_arguments(&self, instance: &str) -> ConnectArguments {
        ConnectArguments::new(&self.host, self.port, &self.user, &self.pass)
            .virtual_host(&self.vhost)
            .heartbeat(self.heartbeat)
            .connection_name(self.connection_name.as_deref().unwrap_or(instance))
            .finish()
    }
}

/// Retry policy of failed connection attempts. The interval is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub interval_ms: u64,
    /// Retries after consecutive failed attempts before giving up, `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub message: MessageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend type key, see [`CACHE_BACKENDS`](crate::cache::CACHE_BACKENDS).
    #[serde(rename = "type")]
    pub kind: String,
    /// Root directory of the `file` backend.
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: String::from("memory"),
            path: PathBuf::from("queues"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Milliseconds.
    pub message_ttl: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
            message_ttl: Some(24 * 60 * 60 * 1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub persistent: bool,
    pub mandatory: bool,
    pub app_id: Option<String>,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            mandatory: true,
            app_id: None,
        }
    }
}
