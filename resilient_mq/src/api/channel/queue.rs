use tracing::{debug, info};

use super::Channel;
use crate::api::{config::QueueConfig, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareArguments {
    pub queue: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Milliseconds, declared as the `x-message-ttl` queue argument.
    pub message_ttl: Option<u32>,
}

impl QueueDeclareArguments {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            message_ttl: None,
        }
    }

    pub fn durable(&mut self, durable: bool) -> &mut Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(&mut self, exclusive: bool) -> &mut Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(&mut self, auto_delete: bool) -> &mut Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn message_ttl(&mut self, message_ttl: Option<u32>) -> &mut Self {
        self.message_ttl = message_ttl;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    pub(crate) fn from_config(queue: &str, config: &QueueConfig) -> Self {
        Self::new(queue)
            .durable(config.durable)
            .exclusive(config.exclusive)
            .auto_delete(config.auto_delete)
            .message_ttl(config.message_ttl)
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
impl Channel {
    /// Delete the queue from the broker, clear its cached operations and drop the broker channel.
    ///
    /// The channel can be used again afterwards, the next operation declares the queue anew.
    /// The cache is cleared even when the broker is not reachable.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.shared.op_lock.lock().await;
        self.shared.cache.clear(self.queue()).await;

        let attached = self.setup_locked().await?;
        attached.handle.queue_delete(self.queue()).await?;
        info!(queue = self.queue(), "queue deleted");

        if let Some(handle) = self.detach() {
            if let Err(err) = handle.close().await {
                debug!(queue = self.queue(), "close after delete: {}", err);
            }
        }
        Ok(())
    }
}
