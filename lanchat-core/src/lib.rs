//! LAN chat protocol library.
//! Host-independent: no sockets, no filesystem; the daemon drives it.

pub mod chunk;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod registry;
pub mod time;
pub mod wire;

pub use chunk::{ChunkProgress, IncomingFile, TransferFault, DEFAULT_CHUNK_SIZE};
pub use identity::{IdentityError, PeerKey};
pub use protocol::{Envelope, TransferId, PROTOCOL_VERSION};
pub use registry::{DeviceRegistry, PeerIdentity, UpsertOutcome};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
