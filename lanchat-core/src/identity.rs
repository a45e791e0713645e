//! Peer identity: the hardware address is the only stable key for a peer.
//! Display names are mutable metadata and never index anything.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware (MAC) address of a peer, normalized to upper-case, colon-separated hex.
/// Only hex digits and separators are accepted, so the key is always safe to turn
/// into a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerKey(String);

impl PeerKey {
    /// Parse a hardware address. Accepts `:` or `-` separators and either case.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-')
        {
            return Err(IdentityError::Invalid(s.to_string()));
        }
        Ok(Self(s.replace('-', ":").to_ascii_uppercase()))
    }

    /// Build a key from six raw octets.
    pub fn from_octets(octets: [u8; 6]) -> Self {
        let parts: Vec<String> = octets.iter().map(|b| format!("{:02X}", b)).collect();
        Self(parts.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name: `AA:BB:CC` becomes `AA_BB_CC`.
    pub fn dir_name(&self) -> String {
        self.0.replace(':', "_")
    }

    /// Inverse of [`PeerKey::dir_name`].
    pub fn from_dir_name(name: &str) -> Result<Self, IdentityError> {
        Self::parse(&name.replace('_', ":"))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerKey {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PeerKey> for String {
    fn from(k: PeerKey) -> Self {
        k.0
    }
}

/// Rejected hardware address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("empty hardware address")]
    Empty,
    #[error("invalid hardware address: {0:?}")]
    Invalid(String),
}
