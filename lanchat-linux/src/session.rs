//! Peer sessions: framed streams, the session table, handshake and the per-session read loop.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::wire::{self, LEN_SIZE};
use lanchat_core::{encode_frame, Envelope, FrameDecodeError, PeerIdentity, PeerKey, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::engine::{shutdown_requested, Shared};
use crate::error::{EngineError, HandshakeError};
use crate::handler;
use crate::local::LocalIdentity;
use crate::transfer::{InboundTransfer, ReadyWaiters};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a session. Each frame is written whole under the lock.
pub struct FrameWriter {
    inner: Mutex<BoxedWriter>,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub async fn send(&self, msg: &Envelope) -> io::Result<()> {
        let frame =
            encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut w = self.inner.lock().await;
        w.write_all(&frame).await?;
        w.flush().await
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.lock().await.shutdown().await;
    }
}

/// Read one frame. The outer error means the stream is unusable; the inner one
/// means this frame was malformed but the stream is still aligned.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Result<Envelope, FrameDecodeError>> {
    let mut header = [0u8; LEN_SIZE];
    reader.read_exact(&mut header).await?;
    let len =
        wire::frame_len(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(wire::decode_payload(&body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub peer: PeerKey,
    pub ip: IpAddr,
    pub direction: Direction,
    pub writer: Arc<FrameWriter>,
    pub ready: Arc<ReadyWaiters>,
    /// Wakes the read loop when the session is replaced.
    closer: Arc<Notify>,
}

struct Entry {
    handle: SessionHandle,
    last_activity: Instant,
}

/// Live sessions, at most one per remote IP.
pub struct SessionTable {
    sessions: Mutex<HashMap<IpAddr, Entry>>,
    next_id: AtomicU64,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a session. Returns the new handle and the one it replaced, if any.
    pub async fn insert(
        &self,
        peer: PeerKey,
        ip: IpAddr,
        direction: Direction,
        writer: Arc<FrameWriter>,
    ) -> (SessionHandle, Option<SessionHandle>) {
        let handle = SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            ip,
            direction,
            writer,
            ready: Arc::new(ReadyWaiters::default()),
            closer: Arc::new(Notify::new()),
        };
        let replaced = self.sessions.lock().await.insert(
            ip,
            Entry {
                handle: handle.clone(),
                last_activity: Instant::now(),
            },
        );
        (handle, replaced.map(|e| e.handle))
    }

    pub async fn get(&self, ip: IpAddr) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&ip).map(|e| e.handle.clone())
    }

    pub async fn touch(&self, ip: IpAddr, id: u64) {
        if let Some(e) = self.sessions.lock().await.get_mut(&ip) {
            if e.handle.id == id {
                e.last_activity = Instant::now();
            }
        }
    }

    pub async fn last_activity(&self, ip: IpAddr) -> Option<Instant> {
        self.sessions.lock().await.get(&ip).map(|e| e.last_activity)
    }

    /// Remove session `id` for `ip`. An entry already replaced by a newer session is left alone.
    pub async fn remove(&self, ip: IpAddr, id: u64) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&ip).map(|e| e.handle.id) != Some(id) {
            return None;
        }
        sessions.remove(&ip).map(|e| e.handle)
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn drain(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .await
            .drain()
            .map(|(_, e)| e.handle)
            .collect()
    }
}

/// Identity the connecting side presents in its hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub mac: PeerKey,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// Connecting side: send hello and our avatar, then read the peer's avatar.
pub async fn handshake_connect<R: AsyncRead + Unpin>(
    reader: &mut R,
    writer: &FrameWriter,
    local: &LocalIdentity,
    listen_port: u16,
    limit: Duration,
) -> Result<Vec<u8>, HandshakeError> {
    writer
        .send(&Envelope::Hello {
            protocol_version: PROTOCOL_VERSION,
            ip: local.ip,
            mac: local.mac.clone(),
            name: local.name.clone(),
            port: listen_port,
        })
        .await?;
    writer
        .send(&Envelope::Avatar {
            data: local.avatar.clone(),
        })
        .await?;
    match read_handshake_frame(reader, limit).await? {
        Envelope::Avatar { data } => Ok(data),
        other => Err(HandshakeError::Unexpected {
            expected: "avatar",
            got: other.kind(),
        }),
    }
}

/// Accepting side: read hello, answer with our avatar, then read the peer's avatar.
pub async fn handshake_accept<R: AsyncRead + Unpin>(
    reader: &mut R,
    writer: &FrameWriter,
    local: &LocalIdentity,
    limit: Duration,
) -> Result<(PeerHello, Vec<u8>), HandshakeError> {
    let hello = match read_handshake_frame(reader, limit).await? {
        Envelope::Hello {
            protocol_version,
            ip,
            mac,
            name,
            port,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(HandshakeError::Version(protocol_version));
            }
            PeerHello { mac, name, ip, port }
        }
        other => {
            return Err(HandshakeError::Unexpected {
                expected: "hello",
                got: other.kind(),
            })
        }
    };
    writer
        .send(&Envelope::Avatar {
            data: local.avatar.clone(),
        })
        .await?;
    match read_handshake_frame(reader, limit).await? {
        Envelope::Avatar { data } => Ok((hello, data)),
        other => Err(HandshakeError::Unexpected {
            expected: "avatar",
            got: other.kind(),
        }),
    }
}

async fn read_handshake_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<Envelope, HandshakeError> {
    let frame = timeout(limit, read_frame(reader))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    Ok(frame?)
}

/// Live session to `peer`, connecting if there is none.
pub(crate) async fn ensure_session(
    shared: &Arc<Shared>,
    peer: &PeerIdentity,
) -> Result<SessionHandle, EngineError> {
    if let Some(handle) = shared.sessions.get(peer.ip).await {
        return Ok(handle);
    }
    connect(shared, peer).await
}

async fn connect(shared: &Arc<Shared>, peer: &PeerIdentity) -> Result<SessionHandle, EngineError> {
    let addr = SocketAddr::new(peer.ip, peer.port);
    let limit = shared.config.connect_timeout();
    debug!(peer = %peer.key, %addr, "connecting");
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let _ = stream.set_nodelay(true);
    let (r, w) = stream.into_split();
    let mut reader: BoxedReader = Box::new(r);
    let writer = Arc::new(FrameWriter::new(Box::new(w)));
    let local = shared.local().await;
    let avatar = handshake_connect(&mut reader, &writer, &local, shared.listen_port, limit).await?;
    shared.registry.set_avatar(&peer.key, avatar);
    shared.registry.set_online(&peer.key, true);
    Ok(activate(shared, peer.key.clone(), peer.ip, Direction::Outbound, reader, writer).await)
}

/// Put a handshaken stream into the table and start its read loop.
async fn activate(
    shared: &Arc<Shared>,
    peer: PeerKey,
    ip: IpAddr,
    direction: Direction,
    reader: BoxedReader,
    writer: Arc<FrameWriter>,
) -> SessionHandle {
    let (handle, replaced) = shared.sessions.insert(peer, ip, direction, writer).await;
    if let Some(old) = replaced {
        debug!(peer = %old.peer, %ip, old_id = old.id, "replacing session");
        old.closer.notify_one();
        old.writer.shutdown().await;
        old.ready.close().await;
    }
    info!(peer = %handle.peer, %ip, ?direction, id = handle.id, "session active");
    tokio::spawn(run_session(shared.clone(), handle.clone(), reader));
    handle
}

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        let accepted = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, from)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_session(&shared, stream, from).await {
                        warn!(%from, error = %e, "inbound handshake failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("accept loop stopped");
}

async fn accept_session(
    shared: &Arc<Shared>,
    stream: TcpStream,
    from: SocketAddr,
) -> Result<(), HandshakeError> {
    let _ = stream.set_nodelay(true);
    let (r, w) = stream.into_split();
    let mut reader: BoxedReader = Box::new(r);
    let writer = Arc::new(FrameWriter::new(Box::new(w)));
    let local = shared.local().await;
    let (hello, avatar) =
        handshake_accept(&mut reader, &writer, &local, shared.config.connect_timeout()).await?;
    if hello.mac == local.mac {
        debug!(%from, "ignoring connection from self");
        return Ok(());
    }
    let outcome = shared.registry.upsert(
        &hello.mac,
        from.ip(),
        hello.port,
        &hello.name,
        lanchat_core::time::now_ms(),
    );
    shared.registry.set_avatar(&hello.mac, avatar);
    handler::peer_upserted(shared, &hello.mac, outcome);
    activate(shared, hello.mac, from.ip(), Direction::Inbound, reader, writer).await;
    Ok(())
}

/// Send `msg` on every live session. Sessions that fail the write are dropped.
pub(crate) async fn broadcast(shared: &Arc<Shared>, msg: &Envelope) {
    for handle in shared.sessions.handles().await {
        if let Err(e) = handle.writer.send(msg).await {
            warn!(peer = %handle.peer, kind = msg.kind(), error = %e, "broadcast send failed");
            drop_session(shared, &handle).await;
        }
    }
}

/// Remove a broken session and mark its peer offline until it is heard from again.
pub(crate) async fn drop_session(shared: &Shared, handle: &SessionHandle) {
    if shared.sessions.remove(handle.ip, handle.id).await.is_none() {
        return;
    }
    handle.ready.close().await;
    handle.writer.shutdown().await;
    if shared.registry.set_online(&handle.peer, false) {
        if let Some(peer) = shared.registry.get(&handle.peer) {
            shared.emit(crate::events::Event::PeerUpdated(peer));
        }
    }
    info!(peer = %handle.peer, ip = %handle.ip, id = handle.id, "session closed");
}

async fn pump_frames(
    mut reader: BoxedReader,
    tx: mpsc::Sender<Result<Envelope, FrameDecodeError>>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(error = %e, "session read failed");
                }
                break;
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn run_session(shared: Arc<Shared>, handle: SessionHandle, reader: BoxedReader) {
    let mut shutdown = shared.shutdown.clone();
    let mut inbound = InboundTransfer::new(shared.policy.clone());
    // One frame in flight keeps receive memory bounded to a single chunk.
    let (tx, mut frames) = mpsc::channel(1);
    let pump = tokio::spawn(pump_frames(reader, tx));
    let mut stopping = false;
    loop {
        let deadline = inbound.deadline();
        let frame = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                stopping = true;
                break;
            }
            _ = handle.closer.notified() => break,
            _ = sleep_until_deadline(deadline) => {
                if let Some(failed) = inbound.on_deadline(Instant::now()) {
                    handler::receive_failed(&shared, &handle, failed).await;
                }
                continue;
            }
            f = frames.recv() => f,
        };
        let msg = match frame {
            None => break,
            Some(Err(e)) => {
                warn!(peer = %handle.peer, error = %e, "dropping malformed frame");
                continue;
            }
            Some(Ok(msg)) => msg,
        };
        shared
            .registry
            .mark_seen(&handle.peer, lanchat_core::time::now_ms());
        shared.sessions.touch(handle.ip, handle.id).await;
        handler::dispatch(&shared, &handle, &mut inbound, msg).await;
    }
    pump.abort();
    if let Some(failed) = inbound.abort() {
        handler::transfer_failed(&shared, &handle.peer, Some(failed.filename), &failed.error);
    }
    if stopping {
        handle.ready.close().await;
    } else {
        drop_session(&shared, &handle).await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn local(name: &str, mac: &str) -> LocalIdentity {
        LocalIdentity {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mac: PeerKey::parse(mac).unwrap(),
            name: name.into(),
            avatar: name.as_bytes().to_vec(),
        }
    }

    fn split(stream: tokio::io::DuplexStream) -> (BoxedReader, FrameWriter) {
        let (r, w) = tokio::io::split(stream);
        (Box::new(r), FrameWriter::new(Box::new(w)))
    }

    #[tokio::test]
    async fn handshake_exchanges_identity_and_avatars() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut ar, aw) = split(a);
        let (mut br, bw) = split(b);
        let alice = local("alice", "02:00:00:00:00:0a");
        let bob = local("bob", "02:00:00:00:00:0b");
        let limit = Duration::from_secs(1);

        let connect = handshake_connect(&mut ar, &aw, &alice, 4000, limit);
        let accept = handshake_accept(&mut br, &bw, &bob, limit);
        let (bob_avatar, accepted) = tokio::join!(connect, accept);
        assert_eq!(bob_avatar.unwrap(), b"bob".to_vec());
        let (hello, alice_avatar) = accepted.unwrap();
        assert_eq!(hello.mac, alice.mac);
        assert_eq!(hello.name, "alice");
        assert_eq!(hello.port, 4000);
        assert_eq!(alice_avatar, b"alice".to_vec());
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_first_frame_and_version() {
        let (a, b) = tokio::io::duplex(4096);
        let (_ar, aw) = split(a);
        let (mut br, bw) = split(b);
        let bob = local("bob", "02:00:00:00:00:0b");
        aw.send(&Envelope::Heartbeat).await.unwrap();
        let err = handshake_accept(&mut br, &bw, &bob, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Unexpected {
                expected: "hello",
                got: "heartbeat"
            }
        ));

        let (a, b) = tokio::io::duplex(4096);
        let (_ar, aw) = split(a);
        let (mut br, bw) = split(b);
        aw.send(&Envelope::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mac: PeerKey::parse("02:00:00:00:00:0a").unwrap(),
            name: "x".into(),
            port: 1,
        })
        .await
        .unwrap();
        let err = handshake_accept(&mut br, &bw, &bob, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Version(v) if v == PROTOCOL_VERSION + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_handshake() {
        let (a, _b) = tokio::io::duplex(4096);
        let (mut ar, aw) = split(a);
        let alice = local("alice", "02:00:00:00:00:0a");
        let err = handshake_connect(&mut ar, &aw, &alice, 1, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[tokio::test]
    async fn malformed_frame_keeps_stream_aligned() {
        let (a, b) = tokio::io::duplex(4096);
        let (_ar, aw) = split(a);
        let (mut br, _bw) = split(b);
        let garbage = [3u8, 0, 0, 0, 0xff, 0xff, 0xff];
        {
            let mut w = aw.inner.lock().await;
            w.write_all(&garbage).await.unwrap();
        }
        aw.send(&Envelope::Text {
            content: "after".into(),
        })
        .await
        .unwrap();
        assert!(read_frame(&mut br).await.unwrap().is_err());
        assert_eq!(
            read_frame(&mut br).await.unwrap().unwrap(),
            Envelope::Text {
                content: "after".into()
            }
        );
    }

    #[tokio::test]
    async fn oversized_header_is_fatal() {
        let (a, b) = tokio::io::duplex(4096);
        let (_ar, aw) = split(a);
        let (mut br, _bw) = split(b);
        {
            let mut w = aw.inner.lock().await;
            w.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        }
        let err = read_frame(&mut br).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn table_replaces_by_ip_and_ignores_stale_removal() {
        let table = SessionTable::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let peer = PeerKey::parse("02:00:00:00:00:0b").unwrap();
        let writer = |s: tokio::io::DuplexStream| Arc::new(FrameWriter::new(Box::new(s)));
        let (s1, _k1) = tokio::io::duplex(64);
        let (s2, _k2) = tokio::io::duplex(64);

        let (first, replaced) = table
            .insert(peer.clone(), ip, Direction::Outbound, writer(s1))
            .await;
        assert!(replaced.is_none());
        let (second, replaced) = table
            .insert(peer.clone(), ip, Direction::Inbound, writer(s2))
            .await;
        assert_eq!(replaced.map(|h| h.id), Some(first.id));
        assert_eq!(table.len().await, 1);

        assert!(table.remove(ip, first.id).await.is_none());
        assert_eq!(table.get(ip).await.map(|h| h.id), Some(second.id));
        assert!(table.remove(ip, second.id).await.is_some());
        assert!(table.remove(ip, second.id).await.is_none());
        assert!(table.is_empty().await);
    }
}
