use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use tokio::{fs, sync::Mutex};
use tracing::{debug, trace, warn};

use super::{check_id, PendingCache, PendingOperation, PendingRecord};
use crate::api::{config::CacheConfig, error::Error, Result};

/// Stores operations on disk: one directory per queue under `path`, one JSON file per operation.
///
/// A queue is read from disk once, on its first access, into an in-memory mirror that serves every
/// later read. After a restart the replay order is file modification time, then id.
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    mirror: Mutex<HashMap<String, Vec<PendingOperation>>>,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mirror: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn build(config: &CacheConfig) -> Result<Arc<dyn PendingCache>> {
        Ok(Arc::new(Self::new(config.path.clone())))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(path_component(queue))
    }

    fn entry_path(&self, queue: &str, id: &str) -> PathBuf {
        self.queue_dir(queue).join(format!("{}.json", path_component(id)))
    }

    /// Read every record of a queue directory, oldest first.
    async fn load(&self, queue: &str) -> Vec<PendingOperation> {
        let dir = self.queue_dir(queue);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(queue, "failed to list cache directory {}: {}", dir.display(), err);
                return Vec::new();
            }
        };

        let mut records: Vec<(SystemTime, PendingRecord)> = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(queue, "failed to read cache directory {}: {}", dir.display(), err);
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<PendingRecord>(&bytes) {
                    Ok(record) => records.push((modified, record)),
                    Err(err) => warn!(queue, "skip corrupt cache entry {}: {}", path.display(), err),
                },
                Err(err) => warn!(queue, "failed to read cache entry {}: {}", path.display(), err),
            }
        }
        records.sort_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| a.id.cmp(&b.id)));
        debug!(queue, count = records.len(), "loaded pending operations from disk");
        records
            .into_iter()
            .map(|(_, record)| PendingOperation::from_record(record))
            .collect()
    }
}

#[async_trait]
impl PendingCache for FileCache {
    async fn store(&self, queue: &str, operation: PendingOperation) -> Result<()> {
        check_id(queue, &operation)?;
        let mut mirror = self.mirror.lock().await;
        if !mirror.contains_key(queue) {
            let loaded = self.load(queue).await;
            mirror.insert(queue.to_owned(), loaded);
        }

        let bytes = serde_json::to_vec_pretty(&operation.record)?;
        fs::create_dir_all(self.queue_dir(queue))
            .await
            .map_err(|err| Error::CacheError(format!("create directory for {}: {}", queue, err)))?;
        let path = self.entry_path(queue, operation.id());
        fs::write(&path, bytes)
            .await
            .map_err(|err| Error::CacheError(format!("write {}: {}", path.display(), err)))?;
        trace!(queue, id = operation.id(), "stored pending operation");

        let entries = mirror.entry(queue.to_owned()).or_default();
        match entries.iter_mut().find(|e| e.id() == operation.id()) {
            Some(entry) => *entry = operation,
            None => entries.push(operation),
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Vec<PendingOperation> {
        let mut mirror = self.mirror.lock().await;
        if let Some(entries) = mirror.get(queue) {
            return entries.clone();
        }
        let loaded = self.load(queue).await;
        mirror.insert(queue.to_owned(), loaded.clone());
        loaded
    }

    async fn remove(&self, queue: &str, id: &str) {
        let mut mirror = self.mirror.lock().await;
        if let Some(entries) = mirror.get_mut(queue) {
            entries.retain(|e| e.id() != id);
        }
        let path = self.entry_path(queue, id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(queue, id, "failed to remove {}: {}", path.display(), err),
        }
    }

    async fn clear(&self, queue: &str) {
        let mut mirror = self.mirror.lock().await;
        mirror.insert(queue.to_owned(), Vec::new());
        let dir = self.queue_dir(queue);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(queue, "failed to clear {}: {}", dir.display(), err),
        }
    }
}

/// Map a queue name or id to a single path component. Distinct names never share a component.
fn path_component(name: &str) -> String {
    let encoded = urlencoding::encode(name);
    // `.` is left as is by the encoding, a leading one would make `.` or `..` or a hidden file
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded.to_string(),
    }
}
