//! Pending-operation cache.
//!
//! Every `send`, `listen` and `receive` is stored here before the channel talks to the broker, and
//! replayed from here after a reconnect. Backends implement [`PendingCache`] and are picked by the
//! `cache.type` key of the channel configuration, see [`CACHE_BACKENDS`].
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    callbacks::SendCallback, config::CacheConfig, consumer::AckMode, consumer::Consumer,
    error::Error, utils::timestamp_secs, Result,
};

mod file;
mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

/////////////////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Send,
    Listen,
    Receive,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Send => f.write_str("send"),
            OperationKind::Listen => f.write_str("listen"),
            OperationKind::Receive => f.write_str("receive"),
        }
    }
}

/// The serializable part of a pending operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: String,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_mode: Option<AckMode>,
    /// Seconds since epoch.
    #[serde(default)]
    pub created_at: u64,
}

/// A cached operation with its process-local handlers.
///
/// Handlers cannot be persisted: an operation loaded by an I/O backend after a restart carries
/// only its [`PendingRecord`].
#[derive(Clone)]
pub struct PendingOperation {
    pub record: PendingRecord,
    pub callback: Option<SendCallback>,
    pub consumer: Option<Arc<dyn Consumer>>,
}

impl PendingOperation {
    pub fn send(id: String, payload: serde_json::Value, callback: Option<SendCallback>) -> Self {
        Self {
            record: PendingRecord {
                id,
                kind: OperationKind::Send,
                payload: Some(payload),
                ack_mode: None,
                created_at: timestamp_secs(),
            },
            callback,
            consumer: None,
        }
    }

    pub fn listen(id: String, ack_mode: AckMode, consumer: Arc<dyn Consumer>) -> Self {
        Self::consume(OperationKind::Listen, id, ack_mode, consumer)
    }

    pub fn receive(id: String, ack_mode: AckMode, consumer: Arc<dyn Consumer>) -> Self {
        Self::consume(OperationKind::Receive, id, ack_mode, consumer)
    }

    fn consume(kind: OperationKind, id: String, ack_mode: AckMode, consumer: Arc<dyn Consumer>) -> Self {
        Self {
            record: PendingRecord {
                id,
                kind,
                payload: None,
                ack_mode: Some(ack_mode),
                created_at: timestamp_secs(),
            },
            callback: None,
            consumer: Some(consumer),
        }
    }

    pub fn from_record(record: PendingRecord) -> Self {
        Self {
            record,
            callback: None,
            consumer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn kind(&self) -> OperationKind {
        self.record.kind
    }

    pub fn ack_mode(&self) -> AckMode {
        self.record.ack_mode.unwrap_or_default()
    }

    /// Report the outcome of a send to its callback, if any.
    pub(crate) fn notify(&self, outcome: Result<String>) {
        if let Some(callback) = &self.callback {
            callback(outcome);
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("record", &self.record)
            .field("callback", &self.callback.is_some())
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Storage contract of a cache backend.
///
/// Only `store` reports failures. Backends backed by I/O log failures of the other methods and
/// degrade to an empty or no-op result.
#[async_trait]
pub trait PendingCache: Send + Sync {
    /// Insert or replace the operation under `(queue, id)`. An empty id is rejected with
    /// [`Error::ConfigError`] before any I/O.
    async fn store(&self, queue: &str, operation: PendingOperation) -> Result<()>;

    /// All operations cached for a queue, in replay order.
    async fn get(&self, queue: &str) -> Vec<PendingOperation>;

    async fn remove(&self, queue: &str, id: &str);

    async fn clear(&self, queue: &str);
}

pub(crate) fn check_id(queue: &str, operation: &PendingOperation) -> Result<()> {
    if operation.id().is_empty() {
        return Err(Error::ConfigError(format!(
            "unable to cache {} operation for {} because of missing id",
            operation.kind(),
            queue
        )));
    }
    Ok(())
}

pub type CacheConstructor = fn(&CacheConfig) -> Result<Arc<dyn PendingCache>>;

/// Cache backends by type key.
pub const CACHE_BACKENDS: &[(&str, CacheConstructor)] =
    &[("memory", MemoryCache::build), ("file", FileCache::build)];

/// Build the backend named by `config.kind`.
pub fn build_cache(config: &CacheConfig) -> Result<Arc<dyn PendingCache>> {
    let constructor = CACHE_BACKENDS
        .iter()
        .find(|(key, _)| *key == config.kind)
        .map(|(_, constructor)| constructor)
        .ok_or_else(|| Error::ConfigError(format!("unknown cache type: {}", config.kind)))?;
    constructor(config)
}
