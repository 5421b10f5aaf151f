use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{event::Event, instance::Instance, Result};

/// Outcome of a `send`: `Ok(id)` once published, `Err` when the channel could not be set up or
/// the publish failed. Either way the operation stays cached until it is published.
pub type SendCallback = Arc<dyn Fn(Result<String>) + Send + Sync>;

/////////////////////////////////////////////////////////////////////////////
/// Instance lifecycle callback, see [`Instance::register_callback`].
#[async_trait]
pub trait InstanceCallback: Send + Sync {
    async fn on_event(&self, instance: &Instance, event: Event);
}

pub struct DefaultInstanceCallback;

#[async_trait]
impl InstanceCallback for DefaultInstanceCallback {
    async fn on_event(&self, instance: &Instance, event: Event) {
        match event {
            Event::Error { .. } => error!(instance = instance.name(), "{}", event),
            Event::Return(_) | Event::Close { .. } | Event::Interrupted => {
                warn!(instance = instance.name(), "{}", event)
            }
            _ => info!(instance = instance.name(), "{}", event),
        }
    }
}
