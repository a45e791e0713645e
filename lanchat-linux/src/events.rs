//! Events emitted to the presentation layer.

use std::path::PathBuf;

use lanchat_core::{PeerIdentity, PeerKey};

#[derive(Debug, Clone)]
pub enum Event {
    PeerAdded(PeerIdentity),
    PeerUpdated(PeerIdentity),
    PeerRemoved(PeerKey),
    UnreadChanged {
        peer: PeerKey,
        unread: u32,
    },
    MessageReceived {
        peer: PeerKey,
        sender_name: String,
        text: String,
        timestamp: u64,
    },
    /// `stored_path` is `None` when the payload could not be persisted; the
    /// presentation layer offers "save as" from the stored copy.
    FileReceived {
        peer: PeerKey,
        filename: String,
        size: u64,
        stored_path: Option<PathBuf>,
    },
    TransferCompleted {
        peer: PeerKey,
        filename: String,
        size: u64,
    },
    TransferFailed {
        peer: PeerKey,
        filename: Option<String>,
        reason: String,
    },
    NameChanged {
        peer: PeerKey,
        old_name: String,
        new_name: String,
    },
    /// A message or file was delivered but its history entry was not written.
    RecordNotPersisted {
        peer: PeerKey,
        reason: String,
    },
}
