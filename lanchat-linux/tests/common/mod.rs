#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use lanchat_core::time::now_ms;
use lanchat_core::PeerKey;
use lanchat_linux::{Config, Engine, Event, LocalIdentity};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub struct Node {
    pub engine: Engine,
    pub events: UnboundedReceiver<Event>,
    pub mac: PeerKey,
    pub name: String,
    pub dir: TempDir,
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        discovery_port: 0,
        transport_port: 0,
        broadcast_addr: Ipv4Addr::LOCALHOST,
        data_dir: dir.to_path_buf(),
        discovery_interval_secs: 3600,
        chunk_size: 1024,
        ready_timeout_secs: 1,
        ready_retries: 2,
        receive_timeout_secs: 2,
        ..Config::default()
    }
}

pub fn identity(name: &str, mac: &str) -> LocalIdentity {
    LocalIdentity {
        ip: LOCALHOST,
        mac: PeerKey::parse(mac).unwrap(),
        name: name.to_string(),
        avatar: Vec::new(),
    }
}

pub async fn node(name: &str, mac: &str) -> Node {
    node_with(name, mac, |_| {}).await
}

pub async fn node_with(name: &str, mac: &str, tweak: impl FnOnce(&mut Config)) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let local = identity(name, mac);
    let (engine, events) = Engine::start_with_identity(config, local.clone())
        .await
        .unwrap();
    Node {
        engine,
        events,
        mac: local.mac,
        name: name.to_string(),
        dir,
    }
}

/// Make `to` known to `from`, as a discovery announce would.
pub fn introduce(from: &Node, to: &Node) {
    from.engine.registry().upsert(
        &to.mac,
        LOCALHOST,
        to.engine.transport_addr().port(),
        &to.name,
        now_ms(),
    );
}

/// Next event matching `pred`, skipping others.
pub async fn expect_event(
    events: &mut UnboundedReceiver<Event>,
    what: &str,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => {}
                None => panic!("event channel closed while waiting for {what}"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never held: {what}");
}
