//! LAN chat engine for Linux: discovery, peer sessions, file transfer, history store.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
mod handler;
pub mod heartbeat;
pub mod local;
pub mod session;
pub mod store;
pub mod transfer;

pub use config::Config;
pub use engine::{Engine, PurgeThreshold};
pub use error::{ConfigError, EngineError, HandshakeError, StoreError, TransferError};
pub use events::Event;
pub use local::LocalIdentity;
