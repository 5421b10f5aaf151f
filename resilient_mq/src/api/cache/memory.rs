use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;

use super::{check_id, PendingCache, PendingOperation};
use crate::api::{config::CacheConfig, utils::lock, Result};

/// Default backend. Keeps operations per queue in insertion order, which is also the replay order.
#[derive(Debug, Default)]
pub struct MemoryCache {
    queues: Mutex<HashMap<String, Vec<PendingOperation>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn build(_config: &CacheConfig) -> Result<Arc<dyn PendingCache>> {
        Ok(Arc::new(Self::new()))
    }
}

#[async_trait]
impl PendingCache for MemoryCache {
    async fn store(&self, queue: &str, operation: PendingOperation) -> Result<()> {
        check_id(queue, &operation)?;
        let mut queues = lock(&self.queues);
        let entries = queues.entry(queue.to_owned()).or_default();
        match entries.iter_mut().find(|e| e.id() == operation.id()) {
            Some(entry) => *entry = operation,
            None => entries.push(operation),
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Vec<PendingOperation> {
        lock(&self.queues).get(queue).cloned().unwrap_or_default()
    }

    async fn remove(&self, queue: &str, id: &str) {
        if let Some(entries) = lock(&self.queues).get_mut(queue) {
            entries.retain(|e| e.id() != id);
        }
    }

    async fn clear(&self, queue: &str) {
        lock(&self.queues).remove(queue);
    }
}
