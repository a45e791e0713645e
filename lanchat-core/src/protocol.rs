//! LAN chat wire protocol: envelope types and version.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::identity::PeerKey;

/// Current protocol version. Carried in announces and the session hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifier tying a metadata envelope to its readiness acknowledgement.
pub type TransferId = [u8; 16];

/// All wire envelope types. Encoding is bincode (variant index first, so the
/// kind is always known before the payload); framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Discovery: advertise presence on the broadcast domain. Never carries the avatar.
    Announce {
        protocol_version: u8,
        ip: IpAddr,
        mac: PeerKey,
        name: String,
        /// Session listen port.
        port: u16,
        /// Sender clock, Unix millis.
        timestamp: u64,
    },
    /// First envelope sent by a session initiator.
    Hello {
        protocol_version: u8,
        ip: IpAddr,
        mac: PeerKey,
        name: String,
        port: u16,
    },
    /// Chat message.
    Text { content: String },
    /// Start of a file transfer. Re-sent with the same id while waiting for readiness.
    FileMetadata {
        transfer_id: TransferId,
        filename: String,
        size: u64,
        /// SHA-256 of the whole payload.
        digest: [u8; 32],
    },
    /// Receiver is ready for the chunks of `transfer_id`.
    FileReady { transfer_id: TransferId },
    FileChunk { data: Vec<u8> },
    FileEnd,
    /// Receiver-side failure reported back to the sender.
    FileError { message: String },
    /// Handshake avatar. Empty data means no avatar.
    Avatar { data: Vec<u8> },
    /// A connected peer changed its avatar.
    AvatarUpdate { mac: PeerKey, data: Vec<u8> },
    /// A connected peer changed its display name.
    NameChange {
        mac: PeerKey,
        old_name: String,
        new_name: String,
    },
    /// Liveness heartbeat.
    Heartbeat,
}

impl Envelope {
    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Announce { .. } => "announce",
            Envelope::Hello { .. } => "hello",
            Envelope::Text { .. } => "text",
            Envelope::FileMetadata { .. } => "file-metadata",
            Envelope::FileReady { .. } => "file-ready",
            Envelope::FileChunk { .. } => "file-chunk",
            Envelope::FileEnd => "file-end",
            Envelope::FileError { .. } => "file-error",
            Envelope::Avatar { .. } => "avatar",
            Envelope::AvatarUpdate { .. } => "avatar-update",
            Envelope::NameChange { .. } => "name-change",
            Envelope::Heartbeat => "heartbeat",
        }
    }
}
