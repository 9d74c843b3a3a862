use std::fmt::Display;

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Prefix of our peer id, azureus style.
    pub const PREFIX: &'static [u8; 8] = b"-TT0100-";

    /// Our peer id, the client prefix followed by 12 random alphanumeric
    /// characters.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(Self::PREFIX);
        let mut rng = rand::thread_rng();
        for b in id[8..].iter_mut() {
            *b = rng.sample(Alphanumeric);
        }
        PeerId(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // most clients put a readable prefix in there
        let printable = self.0.iter().all(|b| b.is_ascii_graphic());
        if printable {
            f.write_str(&String::from_utf8_lossy(&self.0))
        } else {
            f.write_str(&self.to_string())
        }
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Stable key of a connection for its whole life, from dial or accept until
/// it is dropped. Removal from the connection table is a direct lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}
