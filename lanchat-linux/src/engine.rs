//! Engine facade: owns the registry, sessions and store, runs the background tasks,
//! and exposes the commands a presentation layer drives.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lanchat_core::time::{now_ms, DAY_MS};
use lanchat_core::{DeviceRegistry, Envelope, PeerIdentity, PeerKey};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery;
use crate::error::{EngineError, TransferError};
use crate::events::Event;
use crate::handler::{self, with_store};
use crate::heartbeat;
use crate::local::{self, LocalIdentity};
use crate::session::{self, SessionTable};
use crate::store::{PurgeReport, Record, RecordStore};
use crate::transfer::{self, TransferPolicy};

const HISTORY_DIR: &str = "history";

/// State shared by the engine's tasks.
pub(crate) struct Shared {
    pub config: Config,
    pub policy: TransferPolicy,
    /// Bound transport port; differs from the configured one when that is 0.
    pub listen_port: u16,
    pub local: RwLock<LocalIdentity>,
    pub registry: DeviceRegistry,
    pub sessions: SessionTable,
    pub store: Arc<RecordStore>,
    /// Peer whose conversation is open; it gets no unread bumps.
    pub active_peer: Mutex<Option<PeerKey>>,
    pub events: mpsc::UnboundedSender<Event>,
    pub announce_now: Notify,
    pub shutdown: watch::Receiver<bool>,
}

impl Shared {
    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub async fn local(&self) -> LocalIdentity {
        self.local.read().await.clone()
    }
}

/// Resolves once shutdown is requested or the engine is dropped.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// History purge cut-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeThreshold {
    All,
    OlderThanDays(u32),
}

impl PurgeThreshold {
    /// Records with a timestamp below the returned value are removed.
    pub fn cutoff_ms(self, now_ms: u64) -> u64 {
        match self {
            PurgeThreshold::All => u64::MAX,
            PurgeThreshold::OlderThanDays(days) => {
                now_ms.saturating_sub(u64::from(days).saturating_mul(DAY_MS))
            }
        }
    }
}

pub struct Engine {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    transport_addr: SocketAddr,
    discovery_addr: SocketAddr,
}

impl Engine {
    /// Detect the local identity from the host and start.
    pub async fn start(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<Event>), EngineError> {
        let local = LocalIdentity::detect(&config.data_dir)?;
        Self::start_with_identity(config, local).await
    }

    /// Bind both sockets, open the store and spawn discovery, accept, heartbeat and sweep.
    pub async fn start_with_identity(
        config: Config,
        local: LocalIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>), EngineError> {
        config.validate()?;
        let store = RecordStore::open(config.data_dir.join(HISTORY_DIR), config.record_file_ceiling)?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.transport_port)).await?;
        let transport_addr = listener.local_addr()?;
        let udp = Arc::new(discovery::bind_discovery_socket(config.discovery_port).await?);
        let discovery_addr = udp.local_addr()?;
        info!(
            mac = %local.mac,
            name = %local.name,
            ip = %local.ip,
            transport = %transport_addr,
            discovery = %discovery_addr,
            "engine starting"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            policy: config.transfer_policy(),
            listen_port: transport_addr.port(),
            config,
            local: RwLock::new(local),
            registry: DeviceRegistry::new(),
            sessions: SessionTable::new(),
            store: Arc::new(store),
            active_peer: Mutex::new(None),
            events: events_tx,
            announce_now: Notify::new(),
            shutdown: shutdown_rx,
        });
        let tasks = vec![
            tokio::spawn(session::accept_loop(shared.clone(), listener)),
            tokio::spawn(discovery::run_discovery(shared.clone(), udp)),
            tokio::spawn(heartbeat::heartbeat_loop(shared.clone())),
            tokio::spawn(heartbeat::sweep_loop(shared.clone())),
        ];
        Ok((
            Self {
                shared,
                shutdown_tx,
                tasks,
                transport_addr,
                discovery_addr,
            },
            events_rx,
        ))
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.shared.registry.snapshot()
    }

    pub async fn local(&self) -> LocalIdentity {
        self.shared.local().await
    }

    pub fn transport_addr(&self) -> SocketAddr {
        self.transport_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.len().await
    }

    fn running(&self) -> Result<(), EngineError> {
        if *self.shutdown_tx.borrow() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    fn peer(&self, key: &PeerKey) -> Result<PeerIdentity, EngineError> {
        self.running()?;
        self.shared
            .registry
            .get(key)
            .ok_or_else(|| EngineError::UnknownPeer(key.clone()))
    }

    /// Open the conversation with `key`: reuse or establish its session, then clear its unread count.
    pub async fn select_peer(&self, key: &PeerKey) -> Result<(), EngineError> {
        let peer = self.peer(key)?;
        session::ensure_session(&self.shared, &peer).await?;
        *self.shared.active_peer.lock().await = Some(key.clone());
        if let Some(previous) = self.shared.registry.clear_unread(key) {
            if previous > 0 {
                self.shared.emit(Event::UnreadChanged {
                    peer: key.clone(),
                    unread: 0,
                });
            }
        }
        Ok(())
    }

    pub async fn deselect_peer(&self) {
        *self.shared.active_peer.lock().await = None;
    }

    pub async fn selected_peer(&self) -> Option<PeerKey> {
        self.shared.active_peer.lock().await.clone()
    }

    pub async fn send_text(&self, key: &PeerKey, text: &str) -> Result<(), EngineError> {
        let peer = self.peer(key)?;
        let handle = session::ensure_session(&self.shared, &peer).await?;
        let msg = Envelope::Text {
            content: text.to_string(),
        };
        if let Err(e) = handle.writer.send(&msg).await {
            session::drop_session(&self.shared, &handle).await;
            return Err(EngineError::Network(e));
        }
        let local = self.shared.local().await;
        handler::persist_text(&self.shared, key, &peer.name, &local.name, text, true, now_ms())
            .await;
        Ok(())
    }

    /// Send the file at `path`. Returns once the end marker is written or the transfer failed.
    pub async fn send_file(&self, key: &PeerKey, path: &Path) -> Result<(), EngineError> {
        let peer = self.peer(key)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.shared.policy.max_file_size {
            let err = TransferError::TooLarge {
                size,
                max: self.shared.policy.max_file_size,
            };
            handler::transfer_failed(&self.shared, key, Some(filename), &err);
            return Err(err.into());
        }
        let data = tokio::fs::read(path).await?;
        let handle = session::ensure_session(&self.shared, &peer).await?;
        info!(peer = %key, %filename, size, "sending file");
        match transfer::send_file(&handle.writer, &handle.ready, &self.shared.policy, &filename, &data)
            .await
        {
            Ok(_) => {
                let size = data.len() as u64;
                let local = self.shared.local().await;
                handler::persist_file(&self.shared, key, &peer.name, &local.name, &filename, data, true)
                    .await;
                self.shared.emit(Event::TransferCompleted {
                    peer: key.clone(),
                    filename,
                    size,
                });
                Ok(())
            }
            Err(e) => {
                if matches!(e, TransferError::Io(_)) {
                    session::drop_session(&self.shared, &handle).await;
                }
                handler::transfer_failed(&self.shared, key, Some(filename), &e);
                Err(e.into())
            }
        }
    }

    /// Rename this instance, persist it, re-announce and tell every connected peer.
    pub async fn change_local_name(&self, new_name: &str) -> Result<(), EngineError> {
        self.running()?;
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty").into());
        }
        let (mac, old_name) = {
            let mut local = self.shared.local.write().await;
            if local.name == new_name {
                return Ok(());
            }
            let old = std::mem::replace(&mut local.name, new_name.to_string());
            (local.mac.clone(), old)
        };
        if let Err(e) = local::persist_name(&self.shared.config.data_dir, new_name) {
            warn!(error = %e, "could not persist name");
        }
        info!(old = %old_name, new = %new_name, "local name changed");
        self.shared.announce_now.notify_one();
        let msg = Envelope::NameChange {
            mac,
            old_name,
            new_name: new_name.to_string(),
        };
        session::broadcast(&self.shared, &msg).await;
        Ok(())
    }

    /// Replace this instance's avatar (empty clears it) and push it to every connected peer.
    pub async fn change_local_avatar(&self, avatar: Vec<u8>) -> Result<(), EngineError> {
        self.running()?;
        let mac = {
            let mut local = self.shared.local.write().await;
            local.avatar = avatar.clone();
            local.mac.clone()
        };
        if let Err(e) = local::persist_avatar(&self.shared.config.data_dir, &avatar) {
            warn!(error = %e, "could not persist avatar");
        }
        let msg = Envelope::AvatarUpdate { mac, data: avatar };
        session::broadcast(&self.shared, &msg).await;
        Ok(())
    }

    pub async fn purge_history(&self, threshold: PurgeThreshold) -> Result<PurgeReport, EngineError> {
        let cutoff = threshold.cutoff_ms(now_ms());
        let report = with_store(&self.shared, move |store| store.purge_older_than(cutoff)).await?;
        info!(
            ?threshold,
            records = report.records_removed,
            files = report.files_removed,
            "history purged"
        );
        Ok(report)
    }

    pub async fn load_history(&self, key: &PeerKey) -> Result<Vec<Record>, EngineError> {
        let key = key.clone();
        Ok(with_store(&self.shared, move |store| store.load_history(&key)).await?)
    }

    /// Copy a stored file payload to a user-chosen destination.
    pub async fn save_received_file(&self, stored: &Path, dest: &Path) -> Result<PathBuf, EngineError> {
        let not_stored = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a stored file", stored.display()),
            )
        };
        let root = tokio::fs::canonicalize(self.shared.store.root()).await?;
        let resolved = tokio::fs::canonicalize(stored)
            .await
            .map_err(|_| not_stored())?;
        if !resolved.starts_with(&root) {
            return Err(not_stored().into());
        }
        tokio::fs::copy(&resolved, dest).await?;
        Ok(dest.to_path_buf())
    }

    /// Stop every task and close every session.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.shared.sessions.drain().await {
            handle.ready.close().await;
            handle.writer.shutdown().await;
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_thresholds() {
        let now = 10 * DAY_MS;
        assert_eq!(PurgeThreshold::All.cutoff_ms(now), u64::MAX);
        assert_eq!(PurgeThreshold::OlderThanDays(3).cutoff_ms(now), 7 * DAY_MS);
        assert_eq!(PurgeThreshold::OlderThanDays(30).cutoff_ms(now), 0);
    }

    #[tokio::test]
    async fn shutdown_requested_follows_the_flag_and_the_sender() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
