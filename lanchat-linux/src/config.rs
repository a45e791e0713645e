//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::transfer::TransferPolicy;

/// Largest chunk that still fits one frame with the envelope header.
pub const MAX_CHUNK_SIZE: usize = lanchat_core::wire::MAX_FRAME_LEN as usize - 1024;

/// Engine configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_DISCOVERY_PORT, LANCHAT_TRANSPORT_PORT, LANCHAT_BROADCAST_ADDR,
/// LANCHAT_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 12345).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 54321).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Announce destination (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    /// Record store, username and avatar live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Peers silent for longer than this are dropped.
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_secs: u64,
    /// TCP connect and handshake read timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_ready_retries")]
    pub ready_retries: u32,
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
    /// Size ceiling of one record file before rotating to the next number.
    #[serde(default = "default_record_ceiling")]
    pub record_file_ceiling: u64,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_discovery_port() -> u16 {
    12345
}
fn default_transport_port() -> u16 {
    54321
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/lanchat"),
        None => PathBuf::from("Data"),
    }
}
fn default_discovery_interval() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_offline_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_chunk_size() -> usize {
    lanchat_core::DEFAULT_CHUNK_SIZE
}
fn default_ready_timeout() -> u64 {
    5
}
fn default_ready_retries() -> u32 {
    3
}
fn default_receive_timeout() -> u64 {
    30
}
fn default_record_ceiling() -> u64 {
    512 * 1024 * 1024
}
fn default_max_file_size() -> u64 {
    512 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            broadcast_addr: default_broadcast_addr(),
            data_dir: default_data_dir(),
            discovery_interval_secs: default_discovery_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            sweep_interval_secs: default_sweep_interval(),
            offline_timeout_secs: default_offline_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            chunk_size: default_chunk_size(),
            ready_timeout_secs: default_ready_timeout(),
            ready_retries: default_ready_retries(),
            receive_timeout_secs: default_receive_timeout(),
            record_file_ceiling: default_record_ceiling(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Config {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject values that would stall or spin the engine's loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let at_least_one = [
            ("discovery_interval_secs", self.discovery_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("offline_timeout_secs", self.offline_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("receive_timeout_secs", self.receive_timeout_secs),
            ("ready_retries", u64::from(self.ready_retries)),
            ("chunk_size", self.chunk_size as u64),
            ("record_file_ceiling", self.record_file_ceiling),
        ];
        for (field, value) in at_least_one {
            if value == 0 {
                return Err(ConfigError::TooSmall {
                    field,
                    min: 1,
                    value,
                });
            }
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::TooLarge {
                field: "chunk_size",
                max: MAX_CHUNK_SIZE as u64,
                value: self.chunk_size as u64,
            });
        }
        Ok(())
    }

    pub fn transfer_policy(&self) -> TransferPolicy {
        TransferPolicy {
            chunk_size: self.chunk_size,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            ready_retries: self.ready_retries,
            receive_timeout: Duration::from_secs(self.receive_timeout_secs),
            max_file_size: self.max_file_size,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
        lookup(name).and_then(|s| s.trim().parse().ok())
    }
    if let Some(p) = parsed(&lookup, "LANCHAT_DISCOVERY_PORT") {
        c.discovery_port = p;
    }
    if let Some(p) = parsed(&lookup, "LANCHAT_TRANSPORT_PORT") {
        c.transport_port = p;
    }
    if let Some(a) = parsed(&lookup, "LANCHAT_BROADCAST_ADDR") {
        c.broadcast_addr = a;
    }
    if let Some(d) = lookup("LANCHAT_DATA_DIR").filter(|d| !d.is_empty()) {
        c.data_dir = PathBuf::from(d);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
