//! Client configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::core::{HANDSHAKE_RETRY_SCHEDULE, KeyProvider};
use crate::crypto::{CountingKey, EphemeralKey, Keypair};
use crate::transport::{AddressPolicy, CongestionChoice, Extension};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub server_addr: SocketAddr,

    /// Server's long-term public key (32 bytes).
    pub server_public_key: [u8; 32],

    /// Server extension carried in every packet.
    pub server_extension: Extension,

    /// Client extension carried in every packet.
    pub client_extension: Extension,

    /// Server domain name sent in the Initiate.
    pub domain: String,

    /// Client long-term identity (optional, ephemeral if not provided).
    pub client_key: Option<Keypair>,

    /// What to do when the server answers from a new address.
    pub address_policy: AddressPolicy,

    /// Congestion controller for the stream.
    pub congestion: CongestionChoice,

    /// Gaps between handshake sends; the last entry is the final wait.
    pub retry_schedule: Vec<Duration>,

    /// Seed for every random choice the client makes (tests only).
    pub rng_seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            server_public_key: [0u8; 32],
            server_extension: [0u8; 16],
            client_extension: [0u8; 16],
            domain: String::new(),
            client_key: None,
            address_policy: AddressPolicy::default(),
            congestion: CongestionChoice::default(),
            retry_schedule: HANDSHAKE_RETRY_SCHEDULE.to_vec(),
            rng_seed: None,
        }
    }
}

impl ClientConfig {
    /// The RNG every client component draws from.
    pub fn rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Build the client's key provider, drawing any randomness from `rng`.
    pub fn key_provider(&self, rng: &mut StdRng) -> Box<dyn KeyProvider> {
        match &self.client_key {
            Some(keypair) => {
                let nonces = StdRng::seed_from_u64(rng.next_u64());
                Box::new(CountingKey::new(keypair.clone(), 0, nonces))
            }
            None => Box::new(EphemeralKey::generate(rng)),
        }
    }
}

/// Builder for creating a [`ClientConfig`].
#[derive(Debug, Default)]
pub struct CurveCpClientBuilder {
    config: ClientConfig,
}

impl CurveCpClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.config.server_addr = addr;
        self
    }

    /// Set the server's long-term public key.
    pub fn server_public_key(mut self, key: [u8; 32]) -> Self {
        self.config.server_public_key = key;
        self
    }

    /// Set the server extension.
    pub fn server_extension(mut self, extension: Extension) -> Self {
        self.config.server_extension = extension;
        self
    }

    /// Set the client extension.
    pub fn client_extension(mut self, extension: Extension) -> Self {
        self.config.client_extension = extension;
        self
    }

    /// Set the server domain name.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    /// Use a stable client identity.
    pub fn client_key(mut self, keypair: Keypair) -> Self {
        self.config.client_key = Some(keypair);
        self
    }

    /// Set the address policy.
    pub fn address_policy(mut self, policy: AddressPolicy) -> Self {
        self.config.address_policy = policy;
        self
    }

    /// Set the congestion controller.
    pub fn congestion(mut self, congestion: CongestionChoice) -> Self {
        self.config.congestion = congestion;
        self
    }

    /// Set the handshake retry schedule.
    pub fn retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.config.retry_schedule = schedule;
        self
    }

    /// Seed the client's RNG.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = CurveCpClientBuilder::new()
            .server_addr("127.0.0.1:4433".parse().unwrap())
            .server_public_key([9; 32])
            .domain("example.com")
            .address_policy(AddressPolicy::Pin)
            .rng_seed(5)
            .build();
        assert_eq!(config.server_addr.port(), 4433);
        assert_eq!(config.server_public_key, [9; 32]);
        assert_eq!(config.domain, "example.com");
        assert_eq!(config.address_policy, AddressPolicy::Pin);
        assert_eq!(config.retry_schedule.len(), 7);
    }

    #[test]
    fn test_seeded_key_provider_is_deterministic() {
        let config = CurveCpClientBuilder::new().rng_seed(11).build();
        let a = config.key_provider(&mut config.rng());
        let b = config.key_provider(&mut config.rng());
        assert_eq!(a.keypair().public_bytes(), b.keypair().public_bytes());
    }

    #[test]
    fn test_stable_identity_is_kept() {
        let keypair = Keypair::from_secret_bytes([3; 32]);
        let config = CurveCpClientBuilder::new().client_key(keypair.clone()).build();
        let provider = config.key_provider(&mut config.rng());
        assert_eq!(provider.keypair().public_bytes(), keypair.public_bytes());
    }
}
