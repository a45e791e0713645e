//! Device registry: the authoritative table of known peers.
//!
//! One lock guards the whole table. Every operation is a short lookup or
//! mutation; readers get cloned snapshots, never the live table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::identity::PeerKey;

/// A known peer. Keyed by hardware address; everything else is mutable metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub key: PeerKey,
    pub ip: IpAddr,
    /// Session listen port.
    pub port: u16,
    pub name: String,
    /// Last time the peer was heard from, Unix millis.
    pub last_seen_ms: u64,
    pub online: bool,
    pub unread: u32,
    pub avatar: Option<Vec<u8>>,
}

/// Result of [`DeviceRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Existing peer; `changed` is true when IP, port or name differ from before.
    Refreshed { changed: bool },
}

#[derive(Default)]
pub struct DeviceRegistry {
    peers: Mutex<HashMap<PeerKey, PeerIdentity>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PeerKey, PeerIdentity>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a peer or refresh its IP, port, name and timestamp.
    /// A refresh keeps the avatar and the unread counter.
    pub fn upsert(
        &self,
        key: &PeerKey,
        ip: IpAddr,
        port: u16,
        name: &str,
        now_ms: u64,
    ) -> UpsertOutcome {
        let mut peers = self.table();
        match peers.get_mut(key) {
            Some(p) => {
                let changed = !p.online || p.ip != ip || p.port != port || p.name != name;
                p.ip = ip;
                p.port = port;
                p.name = name.to_string();
                p.last_seen_ms = p.last_seen_ms.max(now_ms);
                p.online = true;
                UpsertOutcome::Refreshed { changed }
            }
            None => {
                peers.insert(
                    key.clone(),
                    PeerIdentity {
                        key: key.clone(),
                        ip,
                        port,
                        name: name.to_string(),
                        last_seen_ms: now_ms,
                        online: true,
                        unread: 0,
                        avatar: None,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Session activity from a known peer. Returns false if the peer is unknown.
    pub fn mark_seen(&self, key: &PeerKey, now_ms: u64) -> bool {
        match self.table().get_mut(key) {
            Some(p) => {
                p.last_seen_ms = p.last_seen_ms.max(now_ms);
                p.online = true;
                true
            }
            None => false,
        }
    }

    /// Set the liveness flag without touching the timestamp (session closed).
    pub fn set_online(&self, key: &PeerKey, online: bool) -> bool {
        match self.table().get_mut(key) {
            Some(p) => {
                p.online = online;
                true
            }
            None => false,
        }
    }

    /// Increment the unread counter. Returns the new count.
    pub fn mark_unread(&self, key: &PeerKey) -> Option<u32> {
        self.table().get_mut(key).map(|p| {
            p.unread = p.unread.saturating_add(1);
            p.unread
        })
    }

    /// Reset the unread counter. Returns the previous count.
    pub fn clear_unread(&self, key: &PeerKey) -> Option<u32> {
        self.table()
            .get_mut(key)
            .map(|p| std::mem::take(&mut p.unread))
    }

    /// Store (or clear, with empty data) a peer's avatar.
    pub fn set_avatar(&self, key: &PeerKey, data: Vec<u8>) -> bool {
        match self.table().get_mut(key) {
            Some(p) => {
                p.avatar = if data.is_empty() { None } else { Some(data) };
                true
            }
            None => false,
        }
    }

    /// Change a peer's display name. Returns the old name.
    pub fn rename(&self, key: &PeerKey, new_name: &str) -> Option<String> {
        self.table()
            .get_mut(key)
            .map(|p| std::mem::replace(&mut p.name, new_name.to_string()))
    }

    /// Remove every peer not heard from within `window`. Returns the removed keys.
    pub fn sweep_stale(&self, now_ms: u64, window: Duration) -> Vec<PeerKey> {
        let window_ms = window.as_millis() as u64;
        let mut peers = self.table();
        let stale: Vec<PeerKey> = peers
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen_ms) > window_ms)
            .map(|p| p.key.clone())
            .collect();
        for key in &stale {
            peers.remove(key);
        }
        stale
    }

    pub fn get(&self, key: &PeerKey) -> Option<PeerIdentity> {
        self.table().get(key).cloned()
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<PeerIdentity> {
        self.table().values().find(|p| p.ip == ip).cloned()
    }

    /// Consistent copy of the table, sorted by display name then key.
    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        let mut out: Vec<PeerIdentity> = self.table().values().cloned().collect();
        out.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.key.cmp(&b.key))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}
