//! Reconnection-resilient message queue client on top of RabbitMQ.
//!
//! A [`Registry`] resolves named broker [`Instance`]s from configuration. Each instance owns one
//! broker connection and a set of per-queue [`Channel`]s. Channels cache every pending operation
//! (send, listen, receive) before talking to the broker and replay the cache after the connection
//! comes back, so callers keep their ids across reconnects.
//!
//! The wire protocol is delegated to a broker client behind the [`net::Broker`] trait.
//! [`net::LapinBroker`] talks to RabbitMQ, and [`net::MemoryBroker`] runs in-process.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use resilient_mq::{consumer::{AckMode, DefaultConsumer}, Registry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Registry::new();
//! let queue = registry.channel("jobs", None).unwrap();
//!
//! let id = queue
//!     .send(&serde_json::json!({"job": "resize"}), None, None)
//!     .await
//!     .unwrap();
//! queue
//!     .receive(AckMode::AutoAck, Arc::new(DefaultConsumer::new()), None)
//!     .await
//!     .unwrap();
//! # let _ = id;
//! # }
//! ```
mod api;
pub mod net;

// public API
pub use api::*;
pub use api::{channel::Channel, instance::Instance, registry::Registry};

/////////////////////////////////////////////////////////////////////////////
mod test_utils;
