//! Local identity: hardware address, IP, display name and avatar of this instance.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use lanchat_core::PeerKey;
use rand::RngCore;
use tracing::{debug, warn};

const USERNAME_FILE: &str = "username.txt";
const AVATAR_FILE: &str = "avatar.png";
const HWADDR_FILE: &str = "hwaddr";
const SYS_NET: &str = "/sys/class/net";
const FALLBACK_NAME: &str = "lanchat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub ip: IpAddr,
    pub mac: PeerKey,
    pub name: String,
    /// Raw image bytes; empty when no avatar is set.
    pub avatar: Vec<u8>,
}

impl LocalIdentity {
    /// Detect everything from the host, using files in `data_dir` where present.
    pub fn detect(data_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        let mac = match read_hw_address(Path::new(SYS_NET)) {
            Some(mac) => mac,
            None => load_or_create_hw_address(data_dir)?,
        };
        let ip = detect_local_ip();
        let name = load_name(data_dir).unwrap_or_else(default_name);
        let avatar = fs::read(data_dir.join(AVATAR_FILE)).unwrap_or_default();
        debug!(%mac, %ip, %name, avatar_len = avatar.len(), "local identity");
        Ok(Self {
            ip,
            mac,
            name,
            avatar,
        })
    }
}

/// First non-loopback interface with a usable address, by interface name order.
fn read_hw_address(sys_net: &Path) -> Option<PeerKey> {
    let mut ifaces: Vec<_> = fs::read_dir(sys_net).ok()?.flatten().collect();
    ifaces.sort_by_key(|e| e.file_name());
    ifaces.into_iter().find_map(|entry| {
        if entry.file_name() == "lo" {
            return None;
        }
        let raw = fs::read_to_string(entry.path().join("address")).ok()?;
        let raw = raw.trim();
        if raw.is_empty() || raw == "00:00:00:00:00:00" {
            return None;
        }
        PeerKey::parse(raw).ok()
    })
}

/// Stable random identity for hosts without a readable interface address.
fn load_or_create_hw_address(data_dir: &Path) -> io::Result<PeerKey> {
    let path = data_dir.join(HWADDR_FILE);
    if let Ok(s) = fs::read_to_string(&path) {
        match PeerKey::parse(&s) {
            Ok(k) => return Ok(k),
            Err(e) => warn!(path = %path.display(), error = %e, "regenerating hardware address"),
        }
    }
    let mut octets = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut octets);
    // Locally administered, unicast.
    octets[0] = (octets[0] | 0x02) & 0xfe;
    let key = PeerKey::from_octets(octets);
    fs::write(&path, key.as_str())?;
    Ok(key)
}

/// Outbound interface address. The UDP connect sends no packet.
fn detect_local_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let s = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        s.connect(("8.8.8.8", 80))?;
        Ok(s.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

fn load_name(data_dir: &Path) -> Option<String> {
    let s = fs::read_to_string(data_dir.join(USERNAME_FILE)).ok()?;
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

pub fn persist_name(data_dir: &Path, name: &str) -> io::Result<()> {
    fs::create_dir_all(data_dir)?;
    fs::write(data_dir.join(USERNAME_FILE), name)
}

pub fn persist_avatar(data_dir: &Path, avatar: &[u8]) -> io::Result<()> {
    fs::create_dir_all(data_dir)?;
    let path = data_dir.join(AVATAR_FILE);
    if avatar.is_empty() {
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    } else {
        fs::write(path, avatar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_hw_address_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = load_or_create_hw_address(dir.path()).unwrap();
        let b = load_or_create_hw_address(dir.path()).unwrap();
        assert_eq!(a, b);
        let first = u8::from_str_radix(&a.as_str()[..2], 16).unwrap();
        assert_eq!(first & 0x03, 0x02);
    }

    #[test]
    fn hw_address_from_sysfs_skips_loopback_and_zero() {
        let dir = tempfile::tempdir().unwrap();
        for (iface, addr) in [
            ("lo", "00:00:00:00:00:00"),
            ("dummy0", "00:00:00:00:00:00"),
            ("eth0", "52:54:00:12:34:56\n"),
            ("wlan0", "aa:aa:aa:aa:aa:aa"),
        ] {
            fs::create_dir_all(dir.path().join(iface)).unwrap();
            fs::write(dir.path().join(iface).join("address"), addr).unwrap();
        }
        let key = read_hw_address(dir.path()).unwrap();
        assert_eq!(key.as_str(), "52:54:00:12:34:56");
    }

    #[test]
    fn persisted_name_and_avatar_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        persist_name(dir.path(), "  alice \n").unwrap();
        persist_avatar(dir.path(), &[1, 2, 3]).unwrap();
        let local = LocalIdentity::detect(dir.path()).unwrap();
        assert_eq!(local.name, "alice");
        assert_eq!(local.avatar, vec![1, 2, 3]);

        persist_avatar(dir.path(), &[]).unwrap();
        persist_avatar(dir.path(), &[]).unwrap();
        assert!(!dir.path().join(AVATAR_FILE).exists());
    }

    #[test]
    fn blank_username_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        persist_name(dir.path(), "   ").unwrap();
        assert_eq!(load_name(dir.path()), None);
        assert!(!default_name().is_empty());
    }
}
