//! File transfer: readiness handshake with bounded retry, chunked send, deadline-bounded receive.

use std::collections::HashMap;
use std::time::Duration;

use lanchat_core::chunk::{self, ChunkProgress, IncomingFile};
use lanchat_core::{integrity, Envelope, TransferId};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::error::TransferError;
use crate::session::FrameWriter;

/// Timeouts and limits of one transfer.
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    pub chunk_size: usize,
    /// Wait per metadata attempt for the readiness acknowledgement.
    pub ready_timeout: Duration,
    /// Metadata attempts before giving up.
    pub ready_retries: u32,
    /// Whole-transfer receive deadline, from the metadata envelope on.
    pub receive_timeout: Duration,
    pub max_file_size: u64,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            chunk_size: chunk::DEFAULT_CHUNK_SIZE,
            ready_timeout: Duration::from_secs(5),
            ready_retries: 3,
            receive_timeout: Duration::from_secs(30),
            max_file_size: 512 * 1024 * 1024,
        }
    }
}

impl TransferPolicy {
    /// Upper bound on the time a sender waits for readiness.
    pub fn max_ready_wait(&self) -> Duration {
        self.ready_timeout * self.ready_retries.max(1)
    }
}

/// Answer to a pending readiness wait, delivered by the session read loop.
#[derive(Debug)]
pub enum ReadySignal {
    Ready,
    Refused(String),
}

/// Senders on one session waiting for readiness, by transfer id. Also remembers
/// the last file fully sent, so a late rejection from the receiver can name it.
#[derive(Default)]
pub struct ReadyWaiters {
    pending: Mutex<HashMap<TransferId, oneshot::Sender<ReadySignal>>>,
    last_sent: Mutex<Option<String>>,
}

impl ReadyWaiters {
    pub async fn register(&self, id: TransferId) -> oneshot::Receiver<ReadySignal> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Deliver a signal for `id`. Returns false if nobody is waiting.
    pub async fn resolve(&self, id: &TransferId, signal: ReadySignal) -> bool {
        match self.pending.lock().await.remove(id) {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    /// Refuse every pending wait. Returns how many were waiting.
    pub async fn refuse_all(&self, message: &str) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(ReadySignal::Refused(message.to_string()));
        }
        n
    }

    pub async fn forget(&self, id: &TransferId) {
        self.pending.lock().await.remove(id);
    }

    pub async fn mark_sent(&self, filename: &str) {
        *self.last_sent.lock().await = Some(filename.to_string());
    }

    /// Name of the last file whose chunks all went out, if not yet taken.
    pub async fn take_last_sent(&self) -> Option<String> {
        self.last_sent.lock().await.take()
    }

    /// Session closed: pending waits observe a dropped sender.
    pub async fn close(&self) {
        self.pending.lock().await.clear();
    }
}

/// Send `data` as `filename`: metadata, readiness wait, chunks, end marker.
/// Returns the transfer id once the end marker is written.
pub async fn send_file(
    writer: &FrameWriter,
    waiters: &ReadyWaiters,
    policy: &TransferPolicy,
    filename: &str,
    data: &[u8],
) -> Result<TransferId, TransferError> {
    let size = data.len() as u64;
    if size > policy.max_file_size {
        return Err(TransferError::TooLarge {
            size,
            max: policy.max_file_size,
        });
    }
    let transfer_id = chunk::new_transfer_id();
    let metadata = Envelope::FileMetadata {
        transfer_id,
        filename: filename.to_string(),
        size,
        digest: integrity::hash_payload(data),
    };
    let mut ready = waiters.register(transfer_id).await;
    let result = async {
        wait_ready(writer, &mut ready, &metadata, policy).await?;
        for range in chunk::split_into_chunks(data.len(), policy.chunk_size) {
            writer
                .send(&Envelope::FileChunk {
                    data: data[range].to_vec(),
                })
                .await?;
        }
        // Recorded before the end marker so a rejection racing it still finds the name.
        waiters.mark_sent(filename).await;
        writer.send(&Envelope::FileEnd).await?;
        Ok(())
    }
    .await;
    waiters.forget(&transfer_id).await;
    result.map(|()| transfer_id)
}

async fn wait_ready(
    writer: &FrameWriter,
    ready: &mut oneshot::Receiver<ReadySignal>,
    metadata: &Envelope,
    policy: &TransferPolicy,
) -> Result<(), TransferError> {
    let attempts = policy.ready_retries.max(1);
    for attempt in 1..=attempts {
        writer.send(metadata).await?;
        match tokio::time::timeout(policy.ready_timeout, &mut *ready).await {
            Ok(Ok(ReadySignal::Ready)) => return Ok(()),
            Ok(Ok(ReadySignal::Refused(message))) => return Err(TransferError::Remote(message)),
            Ok(Err(_)) => return Err(TransferError::Closed),
            Err(_) => debug!(attempt, attempts, "no readiness acknowledgement"),
        }
    }
    Err(TransferError::NotReady { attempts })
}

/// Reply to a metadata envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum MetadataReply {
    Ready(TransferId),
    Refuse(String),
}

impl MetadataReply {
    pub fn into_envelope(self) -> Envelope {
        match self {
            MetadataReply::Ready(transfer_id) => Envelope::FileReady { transfer_id },
            MetadataReply::Refuse(message) => Envelope::FileError { message },
        }
    }
}

#[derive(Debug)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct FailedReceive {
    pub filename: String,
    pub error: TransferError,
}

pub type ReceiveOutcome = Result<ReceivedFile, FailedReceive>;

struct Active {
    file: IncomingFile,
    deadline: Instant,
}

/// Receive side of one session: at most one transfer in flight.
pub struct InboundTransfer {
    policy: TransferPolicy,
    current: Option<Active>,
}

impl InboundTransfer {
    pub fn new(policy: TransferPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|a| a.deadline)
    }

    /// Start (or re-acknowledge) a transfer. A metadata envelope with a new id
    /// while another transfer is open fails the open one, returned alongside the reply.
    pub fn on_metadata(
        &mut self,
        transfer_id: TransferId,
        filename: String,
        size: u64,
        digest: [u8; 32],
        now: Instant,
    ) -> (MetadataReply, Option<FailedReceive>) {
        if size > self.policy.max_file_size {
            let err = TransferError::TooLarge {
                size,
                max: self.policy.max_file_size,
            };
            return (MetadataReply::Refuse(err.to_string()), None);
        }
        if let Some(active) = &self.current {
            if active.file.transfer_id == transfer_id {
                return (MetadataReply::Ready(transfer_id), None);
            }
        }
        let superseded = self.current.take().map(|old| FailedReceive {
            filename: old.file.filename,
            error: TransferError::Remote("superseded by a new transfer".into()),
        });
        self.current = Some(Active {
            file: IncomingFile::new(transfer_id, filename, size, digest),
            deadline: now + self.policy.receive_timeout,
        });
        (MetadataReply::Ready(transfer_id), superseded)
    }

    /// Accept a chunk. Returns the outcome once the declared size is reached, or
    /// a failure as soon as a chunk would overrun it. Chunks with no open transfer are dropped.
    pub fn on_chunk(&mut self, data: &[u8]) -> Option<ReceiveOutcome> {
        let active = self.current.as_mut()?;
        match active.file.push_chunk(data) {
            Ok(ChunkProgress::InProgress) => None,
            Ok(ChunkProgress::Complete) => self.finish(),
            Err(fault) => self.current.take().map(|a| {
                Err(FailedReceive {
                    filename: a.file.filename,
                    error: fault.into(),
                })
            }),
        }
    }

    /// End marker: finish the open transfer, if any.
    pub fn on_end(&mut self) -> Option<ReceiveOutcome> {
        self.finish()
    }

    /// Fail the open transfer if its deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<FailedReceive> {
        if self.deadline()? > now {
            return None;
        }
        self.current.take().map(|a| FailedReceive {
            filename: a.file.filename,
            error: TransferError::Timeout(self.policy.receive_timeout),
        })
    }

    /// Session went away mid-transfer.
    pub fn abort(&mut self) -> Option<FailedReceive> {
        self.current.take().map(|a| FailedReceive {
            filename: a.file.filename,
            error: TransferError::Closed,
        })
    }

    fn finish(&mut self) -> Option<ReceiveOutcome> {
        let file = self.current.take()?.file;
        let transfer_id = file.transfer_id;
        let filename = file.filename.clone();
        Some(match file.finish() {
            Ok(data) => Ok(ReceivedFile {
                transfer_id,
                filename,
                data,
            }),
            Err(fault) => Err(FailedReceive {
                filename,
                error: fault.into(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::{read_frame, BoxedWriter};

    fn policy() -> TransferPolicy {
        TransferPolicy {
            chunk_size: 1024,
            ..TransferPolicy::default()
        }
    }

    fn metadata_for(inbound: &mut InboundTransfer, id: TransferId, data: &[u8]) -> MetadataReply {
        let (reply, superseded) = inbound.on_metadata(
            id,
            "x.bin".into(),
            data.len() as u64,
            integrity::hash_payload(data),
            Instant::now(),
        );
        assert!(superseded.is_none());
        reply
    }

    #[test]
    fn receive_completes_on_declared_size() {
        let data: Vec<u8> = (0..2050u32).map(|i| (i % 251) as u8).collect();
        let mut inbound = InboundTransfer::new(policy());
        let id = chunk::new_transfer_id();
        assert_eq!(metadata_for(&mut inbound, id, &data), MetadataReply::Ready(id));
        assert!(inbound.on_chunk(&data[..1024]).is_none());
        let done = inbound.on_chunk(&data[1024..]).unwrap().unwrap();
        assert_eq!(done.data, data);
        assert_eq!(done.transfer_id, id);
        assert!(!inbound.is_active());
        // Late end marker is ignored.
        assert!(inbound.on_end().is_none());
    }

    #[test]
    fn early_end_is_size_mismatch() {
        let data = vec![1u8; 2050];
        let mut inbound = InboundTransfer::new(policy());
        metadata_for(&mut inbound, chunk::new_transfer_id(), &data);
        inbound.on_chunk(&data[..1000]);
        let failed = inbound.on_end().unwrap().unwrap_err();
        assert!(matches!(
            failed.error,
            TransferError::SizeMismatch {
                expected: 2050,
                actual: 1000
            }
        ));
    }

    #[test]
    fn chunks_past_declared_size_fail_at_once() {
        let mut inbound = InboundTransfer::new(policy());
        metadata_for(&mut inbound, [4u8; 16], b"");
        let failed = inbound.on_chunk(&[0u8; 1024]).unwrap().unwrap_err();
        assert!(matches!(
            failed.error,
            TransferError::SizeMismatch {
                expected: 0,
                actual: 1024
            }
        ));
        assert!(!inbound.is_active());
        assert!(inbound.on_chunk(&[0u8; 1024]).is_none());

        let data = vec![2u8; 100];
        metadata_for(&mut inbound, [5u8; 16], &data);
        assert!(inbound.on_chunk(&data[..60]).is_none());
        let failed = inbound.on_chunk(&data[..60]).unwrap().unwrap_err();
        assert!(matches!(
            failed.error,
            TransferError::SizeMismatch {
                expected: 100,
                actual: 120
            }
        ));
    }

    #[test]
    fn repeated_metadata_is_reacknowledged_without_reset() {
        let data = vec![3u8; 100];
        let mut inbound = InboundTransfer::new(policy());
        let id = chunk::new_transfer_id();
        metadata_for(&mut inbound, id, &data);
        inbound.on_chunk(&data[..50]);
        assert_eq!(metadata_for(&mut inbound, id, &data), MetadataReply::Ready(id));
        let done = inbound.on_chunk(&data[50..]).unwrap().unwrap();
        assert_eq!(done.data.len(), 100);
    }

    #[test]
    fn new_transfer_supersedes_open_one() {
        let mut inbound = InboundTransfer::new(policy());
        metadata_for(&mut inbound, [1u8; 16], b"abc");
        let (reply, superseded) =
            inbound.on_metadata([2u8; 16], "y".into(), 1, [0u8; 32], Instant::now());
        assert_eq!(reply, MetadataReply::Ready([2u8; 16]));
        assert_eq!(superseded.unwrap().filename, "x.bin");
    }

    #[test]
    fn oversized_metadata_is_refused() {
        let mut inbound = InboundTransfer::new(TransferPolicy {
            max_file_size: 10,
            ..policy()
        });
        let (reply, _) = inbound.on_metadata([1u8; 16], "big".into(), 11, [0u8; 32], Instant::now());
        assert!(matches!(reply, MetadataReply::Refuse(_)));
        assert!(!inbound.is_active());
    }

    #[test]
    fn deadline_fails_the_open_transfer() {
        let mut inbound = InboundTransfer::new(policy());
        let start = Instant::now();
        inbound.on_metadata([1u8; 16], "slow".into(), 10, [0u8; 32], start);
        assert!(inbound.on_deadline(start + Duration::from_secs(29)).is_none());
        let failed = inbound.on_deadline(start + Duration::from_secs(30)).unwrap();
        assert_eq!(failed.filename, "slow");
        assert!(matches!(failed.error, TransferError::Timeout(_)));
        assert!(inbound.deadline().is_none());
    }

    #[test]
    fn stray_chunks_are_dropped() {
        let mut inbound = InboundTransfer::new(policy());
        assert!(inbound.on_chunk(b"stray").is_none());
        assert!(inbound.on_end().is_none());
        assert!(inbound.abort().is_none());
    }

    fn pipe() -> (Arc<FrameWriter>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let writer: BoxedWriter = Box::new(a);
        (Arc::new(FrameWriter::new(writer)), b)
    }

    #[tokio::test]
    async fn sender_emits_two_chunks_then_end_for_2050_bytes() {
        let (writer, mut remote) = pipe();
        let waiters = Arc::new(ReadyWaiters::default());
        let data: Vec<u8> = (0..2050u32).map(|i| (i * 7) as u8).collect();

        let acker = waiters.clone();
        let receiver = tokio::spawn(async move {
            let mut inbound = InboundTransfer::new(policy());
            let mut chunk_sizes = Vec::new();
            loop {
                match read_frame(&mut remote).await.unwrap().unwrap() {
                    Envelope::FileMetadata {
                        transfer_id,
                        filename,
                        size,
                        digest,
                    } => {
                        inbound.on_metadata(transfer_id, filename, size, digest, Instant::now());
                        acker.resolve(&transfer_id, ReadySignal::Ready).await;
                    }
                    Envelope::FileChunk { data } => {
                        chunk_sizes.push(data.len());
                        if let Some(outcome) = inbound.on_chunk(&data) {
                            let file = outcome.unwrap();
                            assert_eq!(
                                read_frame(&mut remote).await.unwrap().unwrap(),
                                Envelope::FileEnd
                            );
                            return (chunk_sizes, file.data);
                        }
                    }
                    other => panic!("unexpected {}", other.kind()),
                }
            }
        });

        send_file(&writer, &waiters, &policy(), "x.bin", &data)
            .await
            .unwrap();
        let (chunk_sizes, received) = receiver.await.unwrap();
        assert_eq!(chunk_sizes, vec![1024, 1026]);
        assert_eq!(received, data);
        assert_eq!(waiters.take_last_sent().await.as_deref(), Some("x.bin"));
        assert_eq!(waiters.take_last_sent().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_resends_metadata_then_gives_up() {
        let (writer, mut remote) = pipe();
        let waiters = ReadyWaiters::default();
        let counter = tokio::spawn(async move {
            let mut metadata = 0;
            while let Ok(Ok(env)) = read_frame(&mut remote).await {
                if matches!(env, Envelope::FileMetadata { .. }) {
                    metadata += 1;
                }
            }
            metadata
        });

        let started = Instant::now();
        let err = send_file(&writer, &waiters, &TransferPolicy::default(), "x", b"abc")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotReady { attempts: 3 }));
        assert_eq!(waiters.take_last_sent().await, None);
        assert!(started.elapsed() >= TransferPolicy::default().max_ready_wait());
        drop(writer);
        assert_eq!(counter.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn refusal_and_close_end_the_wait() {
        let (writer, _remote) = pipe();
        let waiters = Arc::new(ReadyWaiters::default());

        let w = waiters.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            w.refuse_all("disk full").await;
        });
        let err = send_file(&writer, &waiters, &policy(), "x", b"abc")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Remote(ref m) if m == "disk full"));

        let w = waiters.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            w.close().await;
        });
        let err = send_file(&writer, &waiters, &policy(), "x", b"abc")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Closed));
    }

    #[tokio::test]
    async fn oversized_file_is_refused_locally() {
        let (writer, _remote) = pipe();
        let policy = TransferPolicy {
            max_file_size: 2,
            ..policy()
        };
        let err = send_file(&writer, &ReadyWaiters::default(), &policy, "x", b"abc")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { size: 3, max: 2 }));
    }
}
