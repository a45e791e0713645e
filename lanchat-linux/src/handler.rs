//! Reactions to envelopes received on a session: registry updates, history writes, events.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use lanchat_core::time::now_ms;
use lanchat_core::{Envelope, PeerKey, UpsertOutcome};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::error::{StoreError, TransferError};
use crate::events::Event;
use crate::session::SessionHandle;
use crate::store::{Record, RecordBody, RecordContext, RecordStore};
use crate::transfer::{FailedReceive, InboundTransfer, ReadySignal, ReceiveOutcome, ReceivedFile};

pub(crate) async fn dispatch(
    shared: &Arc<Shared>,
    handle: &SessionHandle,
    inbound: &mut InboundTransfer,
    msg: Envelope,
) {
    match msg {
        Envelope::Text { content } => on_text(shared, &handle.peer, content).await,
        Envelope::FileMetadata {
            transfer_id,
            filename,
            size,
            digest,
        } => {
            debug!(peer = %handle.peer, %filename, size, "incoming file");
            let (reply, superseded) =
                inbound.on_metadata(transfer_id, filename, size, digest, Instant::now());
            if let Some(failed) = superseded {
                transfer_failed(shared, &handle.peer, Some(failed.filename), &failed.error);
            }
            if let Err(e) = handle.writer.send(&reply.into_envelope()).await {
                warn!(peer = %handle.peer, error = %e, "failed to answer file metadata");
            }
        }
        Envelope::FileChunk { data } => {
            if !inbound.is_active() {
                debug!(peer = %handle.peer, len = data.len(), "chunk without transfer");
                return;
            }
            if let Some(outcome) = inbound.on_chunk(&data) {
                receive_finished(shared, handle, outcome).await;
            }
        }
        Envelope::FileEnd => match inbound.on_end() {
            Some(outcome) => receive_finished(shared, handle, outcome).await,
            None => debug!(peer = %handle.peer, "end marker without transfer"),
        },
        Envelope::FileReady { transfer_id } => {
            if !handle.ready.resolve(&transfer_id, ReadySignal::Ready).await {
                debug!(peer = %handle.peer, "readiness for unknown transfer");
            }
        }
        Envelope::FileError { message } => {
            warn!(peer = %handle.peer, %message, "remote reported file error");
            if handle.ready.refuse_all(&message).await == 0 {
                shared.emit(Event::TransferFailed {
                    peer: handle.peer.clone(),
                    filename: handle.ready.take_last_sent().await,
                    reason: message,
                });
            }
        }
        Envelope::Avatar { data } => update_avatar(shared, &handle.peer, data),
        Envelope::AvatarUpdate { mac, data } => update_avatar(shared, &mac, data),
        Envelope::NameChange {
            mac,
            old_name,
            new_name,
        } => {
            let Some(previous) = shared.registry.rename(&mac, &new_name) else {
                debug!(peer = %mac, "name change for unknown peer");
                return;
            };
            if previous != old_name {
                debug!(peer = %mac, %previous, claimed = %old_name, "name change from stale name");
            }
            info!(peer = %mac, old = %previous, new = %new_name, "peer renamed");
            shared.emit(Event::NameChanged {
                peer: mac.clone(),
                old_name: previous,
                new_name,
            });
            emit_updated(shared, &mac);
        }
        Envelope::Heartbeat => {}
        other @ (Envelope::Hello { .. } | Envelope::Announce { .. }) => {
            debug!(peer = %handle.peer, kind = other.kind(), "unexpected envelope on session");
        }
    }
}

/// Emit the registry event matching an upsert.
pub(crate) fn peer_upserted(shared: &Shared, key: &PeerKey, outcome: UpsertOutcome) {
    let Some(peer) = shared.registry.get(key) else {
        return;
    };
    match outcome {
        UpsertOutcome::Inserted => {
            info!(peer = %key, ip = %peer.ip, name = %peer.name, "peer discovered");
            shared.emit(Event::PeerAdded(peer));
        }
        UpsertOutcome::Refreshed { changed: true } => shared.emit(Event::PeerUpdated(peer)),
        UpsertOutcome::Refreshed { changed: false } => {}
    }
}

fn emit_updated(shared: &Shared, key: &PeerKey) {
    if let Some(peer) = shared.registry.get(key) {
        shared.emit(Event::PeerUpdated(peer));
    }
}

fn update_avatar(shared: &Shared, key: &PeerKey, data: Vec<u8>) {
    if shared.registry.set_avatar(key, data) {
        debug!(peer = %key, "avatar updated");
        emit_updated(shared, key);
    }
}

fn peer_name(shared: &Shared, key: &PeerKey) -> String {
    shared
        .registry
        .get(key)
        .map(|p| p.name)
        .unwrap_or_else(|| key.to_string())
}

async fn on_text(shared: &Arc<Shared>, peer: &PeerKey, content: String) {
    let sender = peer_name(shared, peer);
    let timestamp = now_ms();
    persist_text(shared, peer, &sender, &sender, &content, false, timestamp).await;
    bump_unread(shared, peer).await;
    shared.emit(Event::MessageReceived {
        peer: peer.clone(),
        sender_name: sender,
        text: content,
        timestamp,
    });
}

async fn bump_unread(shared: &Shared, peer: &PeerKey) {
    if shared.active_peer.lock().await.as_ref() == Some(peer) {
        return;
    }
    if let Some(unread) = shared.registry.mark_unread(peer) {
        shared.emit(Event::UnreadChanged {
            peer: peer.clone(),
            unread,
        });
    }
}

async fn receive_finished(shared: &Arc<Shared>, handle: &SessionHandle, outcome: ReceiveOutcome) {
    match outcome {
        Ok(file) => file_received(shared, &handle.peer, file).await,
        Err(failed) => receive_failed(shared, handle, failed).await,
    }
}

async fn file_received(shared: &Arc<Shared>, peer: &PeerKey, file: ReceivedFile) {
    let sender = peer_name(shared, peer);
    let size = file.data.len() as u64;
    info!(%peer, filename = %file.filename, size, "file received");
    let stored_path =
        persist_file(shared, peer, &sender, &sender, &file.filename, file.data, false).await;
    bump_unread(shared, peer).await;
    shared.emit(Event::FileReceived {
        peer: peer.clone(),
        filename: file.filename,
        size,
        stored_path,
    });
}

/// Report a failed receive to the sender and the presentation layer.
pub(crate) async fn receive_failed(shared: &Shared, handle: &SessionHandle, failed: FailedReceive) {
    let reply = Envelope::FileError {
        message: failed.error.to_string(),
    };
    if let Err(e) = handle.writer.send(&reply).await {
        debug!(peer = %handle.peer, error = %e, "could not report file error");
    }
    transfer_failed(shared, &handle.peer, Some(failed.filename), &failed.error);
}

pub(crate) fn transfer_failed(
    shared: &Shared,
    peer: &PeerKey,
    filename: Option<String>,
    error: &TransferError,
) {
    warn!(%peer, filename = ?filename, error = %error, "file transfer failed");
    shared.emit(Event::TransferFailed {
        peer: peer.clone(),
        filename,
        reason: error.to_string(),
    });
}

/// Run a blocking store operation off the runtime threads.
pub(crate) async fn with_store<T, F>(shared: &Shared, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&RecordStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = shared.store.clone();
    tokio::task::spawn_blocking(move || f(&*store))
        .await
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn not_persisted(shared: &Shared, peer: &PeerKey, error: &StoreError) {
    warn!(%peer, error = %error, "history entry not written");
    shared.emit(Event::RecordNotPersisted {
        peer: peer.clone(),
        reason: error.to_string(),
    });
}

/// Append a text record. Failures are reported, never fatal.
pub(crate) async fn persist_text(
    shared: &Shared,
    peer: &PeerKey,
    peer_name: &str,
    sender_name: &str,
    text: &str,
    sent: bool,
    timestamp: u64,
) {
    let (key, peer_name, sender_name, text) = (
        peer.clone(),
        peer_name.to_string(),
        sender_name.to_string(),
        text.to_string(),
    );
    let result = with_store(shared, move |store| {
        let ctx = RecordContext {
            peer: &key,
            peer_name: &peer_name,
            sender_name: &sender_name,
            sent,
            timestamp,
        };
        store.append_message(&ctx, &text)
    })
    .await;
    if let Err(e) = result {
        not_persisted(shared, peer, &e);
    }
}

/// Store a file payload with its record. Returns where it was written.
pub(crate) async fn persist_file(
    shared: &Shared,
    peer: &PeerKey,
    peer_name: &str,
    sender_name: &str,
    filename: &str,
    data: Vec<u8>,
    sent: bool,
) -> Option<PathBuf> {
    let (key, peer_name, sender_name, filename) = (
        peer.clone(),
        peer_name.to_string(),
        sender_name.to_string(),
        filename.to_string(),
    );
    let result = with_store(shared, move |store| {
        let ctx = RecordContext {
            peer: &key,
            peer_name: &peer_name,
            sender_name: &sender_name,
            sent,
            timestamp: now_ms(),
        };
        store.append_file(&ctx, &filename, &data)
    })
    .await;
    match result {
        Ok(Record {
            body: RecordBody::File { path, .. },
            ..
        }) => Some(path),
        Ok(_) => None,
        Err(e) => {
            not_persisted(shared, peer, &e);
            None
        }
    }
}
