use self::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/////////////////////////////////////////////////////////////////////////////
mod utils;

pub mod cache;
pub mod callbacks;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod instance;
pub mod registry;
