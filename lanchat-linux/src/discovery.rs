//! LAN discovery: UDP broadcast announces out, announces in, registry upserts.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::time::now_ms;
use lanchat_core::{
    decode_frame, encode_frame, DeviceRegistry, Envelope, PeerKey, UpsertOutcome, PROTOCOL_VERSION,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::engine::{shutdown_requested, Shared};
use crate::handler;
use crate::local::LocalIdentity;

pub(crate) async fn run_discovery(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let announce_task = tokio::spawn(announce_loop(shared.clone(), socket.clone()));
    let listen_task = tokio::spawn(listen_loop(shared, socket));
    let _ = tokio::join!(announce_task, listen_task);
}

pub async fn bind_discovery_socket(port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

pub fn announce_for(local: &LocalIdentity, transport_port: u16, timestamp: u64) -> Envelope {
    Envelope::Announce {
        protocol_version: PROTOCOL_VERSION,
        ip: local.ip,
        mac: local.mac.clone(),
        name: local.name.clone(),
        port: transport_port,
        timestamp,
    }
}

async fn announce_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let dest = SocketAddr::from((shared.config.broadcast_addr, shared.config.discovery_port));
    let mut shutdown = shared.shutdown.clone();
    loop {
        if let Err(e) = announce_once(&shared, &socket, dest).await {
            warn!(%dest, error = %e, "announce failed");
        }
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(shared.config.discovery_interval()) => {}
            _ = shared.announce_now.notified() => debug!("identity changed, announcing"),
        }
    }
    debug!("announce loop stopped");
}

async fn announce_once(shared: &Shared, socket: &UdpSocket, dest: SocketAddr) -> io::Result<()> {
    let local = shared.local().await;
    let frame = encode_frame(&announce_for(&local, shared.listen_port, now_ms()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    socket.send_to(&frame, dest).await?;
    Ok(())
}

async fn listen_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65536];
    let mut shutdown = shared.shutdown.clone();
    loop {
        let received = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let (n, from) = match received {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "discovery receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let msg = match decode_frame(&buf[..n]) {
            Ok((msg, _)) => msg,
            Err(e) => {
                debug!(%from, error = %e, "ignoring undecodable datagram");
                continue;
            }
        };
        let local_mac = shared.local.read().await.mac.clone();
        if let Some((key, outcome)) = apply_announce(&shared.registry, &local_mac, msg, from, now_ms())
        {
            handler::peer_upserted(&shared, &key, outcome);
        }
    }
    debug!("discovery listener stopped");
}

/// Apply a received datagram to the registry. Our own announces, foreign protocol
/// versions and anything but an announce are ignored.
pub fn apply_announce(
    registry: &DeviceRegistry,
    local_mac: &PeerKey,
    msg: Envelope,
    from: SocketAddr,
    now_ms: u64,
) -> Option<(PeerKey, UpsertOutcome)> {
    let kind = msg.kind();
    let Envelope::Announce {
        protocol_version,
        ip,
        mac,
        name,
        port,
        ..
    } = msg
    else {
        debug!(%from, kind, "ignoring non-announce datagram");
        return None;
    };
    if protocol_version != PROTOCOL_VERSION {
        debug!(%from, protocol_version, "ignoring announce with other protocol version");
        return None;
    }
    if mac == *local_mac {
        return None;
    }
    // A peer that could not find its own address announces loopback or nothing.
    let ip = if ip.is_unspecified() || (ip.is_loopback() && !from.ip().is_loopback()) {
        from.ip()
    } else {
        ip
    };
    let outcome = registry.upsert(&mac, ip, port, &name, now_ms);
    Some((mac, outcome))
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    fn key(s: &str) -> PeerKey {
        PeerKey::parse(s).unwrap()
    }

    fn announce(mac: &str, ip: IpAddr, name: &str) -> Envelope {
        Envelope::Announce {
            protocol_version: PROTOCOL_VERSION,
            ip,
            mac: key(mac),
            name: name.into(),
            port: 54321,
            timestamp: 1,
        }
    }

    #[test]
    fn announce_inserts_then_refreshes() {
        let registry = DeviceRegistry::new();
        let me = key("02:00:00:00:00:01");
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let from = SocketAddr::new(ip, 12345);

        let (k, outcome) =
            apply_announce(&registry, &me, announce("aa:bb:cc:dd:ee:ff", ip, "bob"), from, 10)
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(k.as_str(), "AA:BB:CC:DD:EE:FF");

        let (_, outcome) =
            apply_announce(&registry, &me, announce("aa:bb:cc:dd:ee:ff", ip, "bob"), from, 20)
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::Refreshed { changed: false });
        let (_, outcome) =
            apply_announce(&registry, &me, announce("aa:bb:cc:dd:ee:ff", ip, "robert"), from, 30)
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::Refreshed { changed: true });

        let peer = registry.get(&k).unwrap();
        assert_eq!(peer.name, "robert");
        assert_eq!(peer.last_seen_ms, 30);
        assert_eq!(peer.port, 54321);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn announced_peer_expires_after_offline_window() {
        let registry = DeviceRegistry::new();
        let me = key("02:00:00:00:00:01");
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let t = 1_000_000;
        let window = Duration::from_secs(30);
        let (k, _) = apply_announce(
            &registry,
            &me,
            announce("AA:BB", ip, "A"),
            SocketAddr::new(ip, 12345),
            t,
        )
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&k).unwrap().ip, ip);

        assert!(registry.sweep_stale(t + 30_000, window).is_empty());
        assert_eq!(registry.sweep_stale(t + 30_001, window), vec![k]);
        assert!(registry.is_empty());
    }

    #[test]
    fn own_and_foreign_datagrams_are_ignored() {
        let registry = DeviceRegistry::new();
        let me = key("02:00:00:00:00:01");
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let from = SocketAddr::new(ip, 12345);

        assert!(apply_announce(&registry, &me, announce("02:00:00:00:00:01", ip, "me"), from, 1)
            .is_none());
        let mut other_version = announce("aa:bb:cc:dd:ee:ff", ip, "bob");
        if let Envelope::Announce {
            protocol_version, ..
        } = &mut other_version
        {
            *protocol_version += 1;
        }
        assert!(apply_announce(&registry, &me, other_version, from, 1).is_none());
        assert!(apply_announce(&registry, &me, Envelope::Heartbeat, from, 1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn loopback_announce_from_lan_uses_source_address() {
        let registry = DeviceRegistry::new();
        let me = key("02:00:00:00:00:01");
        let from: SocketAddr = "192.168.1.30:12345".parse().unwrap();
        let (k, _) = apply_announce(
            &registry,
            &me,
            announce("aa:bb:cc:dd:ee:01", IpAddr::V4(Ipv4Addr::LOCALHOST), "carol"),
            from,
            1,
        )
        .unwrap();
        assert_eq!(registry.get(&k).unwrap().ip, from.ip());
    }

    #[tokio::test]
    async fn announce_crosses_loopback_socket() {
        let rx = bind_discovery_socket(0).await.unwrap();
        let tx = bind_discovery_socket(0).await.unwrap();
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, rx.local_addr().unwrap().port()));
        let local = LocalIdentity {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mac: key("02:00:00:00:00:0a"),
            name: "alice".into(),
            avatar: Vec::new(),
        };
        let frame = encode_frame(&announce_for(&local, 4242, 7)).unwrap();
        tx.send_to(&frame, dest).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), rx.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (msg, _) = decode_frame(&buf[..n]).unwrap();
        let registry = DeviceRegistry::new();
        let (k, outcome) =
            apply_announce(&registry, &key("02:00:00:00:00:0b"), msg, from, 7).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        let peer = registry.get(&k).unwrap();
        assert_eq!(peer.name, "alice");
        assert_eq!(peer.port, 4242);
    }
}
