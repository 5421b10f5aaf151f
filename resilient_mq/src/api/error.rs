//! Error type can be returned by the APIs.

/// A list of errors can be returned by the APIs.
///
/// The error is `Clone` because one failure is often reported twice: to the callback of the
/// operation that hit it, and as an [`Event::Error`](crate::event::Event::Error).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error during openning a connection to the broker.
    #[error("connection open error: {0}")]
    ConnectionOpenError(String),
    /// Error during closing a connection.
    #[error("connection close error: {0}")]
    ConnectionCloseError(String),
    /// The owning instance has no live connection yet. The operation stays cached and is
    /// retried once the instance reports `connected`.
    #[error("not connected: {0}")]
    NotConnected(String),
    /// Error during openning a channel or declaring its queue.
    #[error("channel open error: {0}")]
    ChannelOpenError(String),
    /// Error during closing a channel.
    #[error("channel close error: {0}")]
    ChannelCloseError(String),
    /// Error when using the channel. Usually due to incorrect usage by user.
    #[error("channel usage error: {0}")]
    ChannelUseError(String),
    /// Error reported by the broker client or its network layer.
    #[error("network error: {0}")]
    NetworkError(String),
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),
    /// Error reported by a pending-operation cache backend.
    #[error("cache error: {0}")]
    CacheError(String),
    /// Payload could not be encoded to, or decoded from, JSON.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// `true` for failures that resolve on their own once the broker connection is back.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotConnected(_) | Error::NetworkError(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
