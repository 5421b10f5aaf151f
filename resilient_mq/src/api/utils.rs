use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

/// Lock a std mutex, ignoring poison left by a panicked user callback.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generate a unique id for an operation when the caller does not supply one.
pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Seconds since unix epoch, as AMQP timestamps are.
pub(crate) fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Queue name of a channel owned by an instance.
pub(crate) fn queue_name(instance: &str, channel: &str) -> String {
    format!("{}-{}", instance, channel)
}
