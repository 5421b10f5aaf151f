//! Lifecycle events of instances and channels.
use std::fmt;

use super::error::Error;
use crate::net::ReturnedMessage;

/// Events emitted by [`Instance`](crate::Instance) and [`Channel`](crate::Channel) to their
/// subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// The instance established a broker connection.
    Connected,
    /// The instance dropped its broker connection.
    Disconnected,
    /// The live connection failed. Followed by `Disconnected`, then a delayed reconnect.
    Interrupted,
    /// Emitted right after `Connected` when the connection follows an interruption.
    /// Channels replay their pending operations.
    Reconnected,
    /// `source` is the instance name or the queue name of the channel raising it.
    Error { source: String, error: Error },
    /// A mandatory message the broker could not route.
    Return(ReturnedMessage),
    /// The broker closed a channel.
    Close { channel: String },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connected => "connected",
            Event::Disconnected => "disconnected",
            Event::Interrupted => "interrupted",
            Event::Reconnected => "reconnected",
            Event::Error { .. } => "error",
            Event::Return(_) => "return",
            Event::Close { .. } => "close",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Error { source, error } => write!(f, "error from {}: {}", source, error),
            Event::Return(message) => write!(
                f,
                "return from {}: {} {}",
                message.queue, message.reply_code, message.reply_text
            ),
            Event::Close { channel } => write!(f, "close of channel {}", channel),
            _ => f.write_str(self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Event;
    use crate::error::Error;

    #[test]
    fn test_display() {
        assert_eq!("reconnected", Event::Reconnected.to_string());
        let event = Event::Error {
            source: "_default_".to_string(),
            error: Error::NetworkError("reset".to_string()),
        };
        assert_eq!("error", event.kind());
        assert_eq!("error from _default_: network error: reset", event.to_string());
    }
}
