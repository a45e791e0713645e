//! Chunk manager: split an outgoing file into chunks, accumulate and verify an incoming one.

use std::ops::Range;

use sha2::{Digest, Sha256};

use crate::protocol::TransferId;

/// Default chunk size in bytes (the transport buffer size).
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Initial reassembly buffer is capped; a peer could declare any size.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// Fresh random transfer id.
pub fn new_transfer_id() -> TransferId {
    uuid::Uuid::new_v4().into_bytes()
}

/// Split `total_len` bytes into chunk ranges of `chunk_size`.
/// The final chunk absorbs any remainder shorter than a full chunk, so no runt
/// chunk is ever sent: 2050 bytes at 1024 gives 1024 + 1026.
pub fn split_into_chunks(total_len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    if total_len == 0 {
        return Vec::new();
    }
    let count = (total_len / size).max(1);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * size;
        let end = if i + 1 == count { total_len } else { start + size };
        out.push(start..end);
    }
    out
}

/// Progress after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    InProgress,
    /// Accumulated byte count reached the declared size.
    Complete,
}

/// Why a finished transfer was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferFault {
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("digest mismatch")]
    DigestMismatch,
}

/// Per-transfer receive state: declared metadata plus accumulated bytes.
pub struct IncomingFile {
    pub transfer_id: TransferId,
    pub filename: String,
    pub expected_size: u64,
    expected_digest: [u8; 32],
    data: Vec<u8>,
    hasher: Sha256,
}

impl IncomingFile {
    pub fn new(
        transfer_id: TransferId,
        filename: String,
        expected_size: u64,
        expected_digest: [u8; 32],
    ) -> Self {
        let cap = (expected_size as usize).min(MAX_PREALLOC);
        Self {
            transfer_id,
            filename,
            expected_size,
            expected_digest,
            data: Vec::with_capacity(cap),
            hasher: Sha256::new(),
        }
    }

    /// Append a chunk. Reports `Complete` once the declared size has arrived;
    /// a zero-length file only completes on the end marker. A chunk that would
    /// overrun the declared size is rejected without being buffered.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<ChunkProgress, TransferFault> {
        let actual = self.received().saturating_add(chunk.len() as u64);
        if actual > self.expected_size {
            return Err(TransferFault::SizeMismatch {
                expected: self.expected_size,
                actual,
            });
        }
        self.hasher.update(chunk);
        self.data.extend_from_slice(chunk);
        if self.expected_size > 0 && actual == self.expected_size {
            Ok(ChunkProgress::Complete)
        } else {
            Ok(ChunkProgress::InProgress)
        }
    }

    pub fn received(&self) -> u64 {
        self.data.len() as u64
    }

    /// Verify size, then digest. Returns the reassembled bytes on success.
    pub fn finish(self) -> Result<Vec<u8>, TransferFault> {
        let actual = self.received();
        if actual != self.expected_size {
            return Err(TransferFault::SizeMismatch {
                expected: self.expected_size,
                actual,
            });
        }
        let digest: [u8; 32] = self.hasher.finalize().into();
        if digest != self.expected_digest {
            return Err(TransferFault::DigestMismatch);
        }
        Ok(self.data)
    }
}
