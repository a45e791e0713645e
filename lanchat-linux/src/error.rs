//! Error taxonomy of the engine.

use std::io;
use std::time::Duration;

use lanchat_core::{FrameDecodeError, FrameEncodeError, PeerKey, TransferFault};

/// A configuration value the engine cannot run with.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: u64,
        value: u64,
    },
    #[error("{field} must be at most {max}, got {value}")]
    TooLarge {
        field: &'static str,
        max: u64,
        value: u64,
    },
}

/// Record store failure (disk full, permissions, corrupt metadata).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
}

/// Session establishment failed before the session became active.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake timed out")]
    Timeout,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("malformed handshake frame: {0}")]
    Malformed(#[from] FrameDecodeError),
}

/// A single file transfer failed. Never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("receiver not ready after {attempts} attempts")]
    NotReady { attempts: u32 },
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("digest mismatch")]
    DigestMismatch,
    #[error("file of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("session closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransferFault> for TransferError {
    fn from(f: TransferFault) -> Self {
        match f {
            TransferFault::SizeMismatch { expected, actual } => {
                TransferError::SizeMismatch { expected, actual }
            }
            TransferFault::DigestMismatch => TransferError::DigestMismatch,
        }
    }
}

/// Error returned by engine commands.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerKey),
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("engine is shutting down")]
    ShuttingDown,
}
