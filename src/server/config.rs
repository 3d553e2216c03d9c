//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::core::{CurveCpError, CurveCpResult, DEFAULT_COOKIE_CACHE_SIZE, KeyProvider};
use crate::crypto::{CountingKey, Keypair};
use crate::transport::{AddressPolicy, CongestionChoice, Extension};

/// Default maximum number of live connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default number of accepted streams waiting for the application.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Server long-term identity (required).
    pub server_key: Option<Keypair>,

    /// Only accept packets addressed to this server extension.
    pub extension: Option<Extension>,

    /// What to do when a client appears at a new address.
    pub address_policy: AddressPolicy,

    /// Congestion controller for each connection.
    pub congestion: CongestionChoice,

    /// Number of recent Cookie replies kept for duplicate Hellos.
    pub cookie_cache_size: usize,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Accepted streams queued for the application before new connections
    /// are rejected with a failure resolution.
    pub accept_backlog: usize,

    /// Seed for every random choice the server makes (tests only).
    pub rng_seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            server_key: None,
            extension: None,
            address_policy: AddressPolicy::default(),
            congestion: CongestionChoice::default(),
            cookie_cache_size: DEFAULT_COOKIE_CACHE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            rng_seed: None,
        }
    }
}

impl ServerConfig {
    /// The RNG every server component draws from.
    pub fn rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Build the server's key provider.
    pub fn key_provider(&self, rng: &mut StdRng) -> CurveCpResult<Box<dyn KeyProvider>> {
        let keypair = self
            .server_key
            .clone()
            .ok_or_else(|| CurveCpError::Config("server key is required".into()))?;
        let nonces = StdRng::seed_from_u64(rng.next_u64());
        Ok(Box::new(CountingKey::new(keypair, 0, nonces)))
    }
}

/// Builder for creating a [`ServerConfig`].
#[derive(Debug, Default)]
pub struct CurveCpServerBuilder {
    config: ServerConfig,
}

impl CurveCpServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the server's long-term identity.
    pub fn server_key(mut self, keypair: Keypair) -> Self {
        self.config.server_key = Some(keypair);
        self
    }

    /// Only accept packets carrying this server extension.
    pub fn extension(mut self, extension: Extension) -> Self {
        self.config.extension = Some(extension);
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

    /// Set the cookie reply cache capacity.
    pub fn cookie_cache_size(mut self, size: usize) -> Self {
        self.config.cookie_cache_size = size;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set how many accepted streams may wait for the application.
    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    /// Seed the server's RNG.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
