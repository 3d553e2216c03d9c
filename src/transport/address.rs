//! Peer identity and connection policy.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;

use crate::core::PUBLIC_KEY_SIZE;

use super::congestion::{Chicago, CongestionController, Remy, WhiskerTree};
use super::packet::Extension;

/// Who is on one end of a connection.
///
/// The same shape describes both the local and the remote end: extensions
/// and domain are shared, the long-term key and transport address belong to
/// the end being described.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Client extension.
    pub client_extension: Extension,
    /// Server extension.
    pub server_extension: Extension,
    /// Server domain name.
    pub domain: String,
    /// Long-term public key of this end.
    pub long_term_key: [u8; PUBLIC_KEY_SIZE],
    /// Transport address of this end.
    pub address: SocketAddr,
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key: String = self.long_term_key[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        f.debug_struct("PeerIdentity")
            .field("domain", &self.domain)
            .field("long_term_key", &key)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// A datagram ready to leave through the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Where to send it.
    pub destination: SocketAddr,
    /// Encoded packet.
    pub payload: Vec<u8>,
}

/// What to do when an authenticated packet arrives from a new address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressPolicy {
    /// Keep sending to the address the handshake completed with.
    Pin,
    /// Follow the source address of the newest authenticated packet.
    #[default]
    MigrateToNewest,
}

impl AddressPolicy {
    /// Apply the policy: returns the address to use from now on.
    pub fn apply(self, current: SocketAddr, source: SocketAddr) -> SocketAddr {
        match self {
            AddressPolicy::Pin => current,
            AddressPolicy::MigrateToNewest => source,
        }
    }
}

/// Which congestion controller each connection gets.
#[derive(Debug, Clone, Default)]
pub enum CongestionChoice {
    /// The default pacing heuristic.
    #[default]
    Chicago,
    /// The table-driven controller over a shared whisker tree.
    Remy(Arc<WhiskerTree>),
}

impl CongestionChoice {
    /// Build a fresh controller for one connection.
    pub fn build(&self, now: Instant, rng: StdRng) -> Box<dyn CongestionController> {
        match self {
            CongestionChoice::Chicago => Box::new(Chicago::new(now, rng)),
            CongestionChoice::Remy(tree) => Box::new(Remy::new(Arc::clone(tree))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_address_policy() {
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        assert_eq!(AddressPolicy::Pin.apply(a, b), a);
        assert_eq!(AddressPolicy::MigrateToNewest.apply(a, b), b);
        assert_eq!(AddressPolicy::default(), AddressPolicy::MigrateToNewest);
    }

    #[test]
    fn test_congestion_choice_builds() {
        let now = Instant::now();
        let chicago = CongestionChoice::default().build(now, StdRng::seed_from_u64(0));
        assert_eq!(chicago.window(), None);
    }

    #[test]
    fn test_identity_debug_is_short() {
        let id = PeerIdentity {
            client_extension: [0; 16],
            server_extension: [0; 16],
            domain: "example.com".into(),
            long_term_key: [0xab; 32],
            address: "127.0.0.1:1".parse().unwrap(),
        };
        let shown = format!("{id:?}");
        assert!(shown.contains("abababababababab"));
        assert!(!shown.contains(&"ab".repeat(9)));
    }
}
