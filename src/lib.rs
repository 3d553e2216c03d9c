//! # CurveCP
//!
//! Forward-secure, authenticated and encrypted transport over UDP.
//!
//! CurveCP gives every connection:
//!
//! - **Security**: curve25519-xsalsa20-poly1305 boxes on every packet, with
//!   short-term keys discarded when the connection ends
//! - **Statelessness**: servers hand out self-validating cookies and keep no
//!   per-client memory until a valid Initiate arrives
//! - **Reliability**: one ordered byte stream each way, with selective
//!   acknowledgments and retransmission
//! - **Congestion control**: the Chicago pacing heuristic or a table-driven
//!   Remy controller
//!
//! ## Feature Flags
//!
//! - `client` (default): async client endpoint over tokio
//! - `server` (default): async server endpoint over tokio
//!
//! The sans-IO state machines ([`client::ClientConnection`],
//! [`server::ServerDispatcher`]) are always built.
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and collaborator traits
//! - [`crypto`]: keys, boxes, nonces and replay protection
//! - [`transport`]: packet and message codecs, the reliable stream and the
//!   congestion controllers
//! - [`client`]: client handshake and endpoint
//! - [`server`]: server dispatcher and endpoint
//!
//! ## Example Usage
//!
//! ```rust
//! use std::time::Instant;
//!
//! use curvecp::prelude::*;
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//!
//! let server_key = Keypair::from_secret_bytes([7; 32]);
//! let config = ClientConfig {
//!     server_public_key: *server_key.public_bytes(),
//!     domain: "example.com".into(),
//!     ..ClientConfig::default()
//! };
//!
//! let mut rng = StdRng::seed_from_u64(1);
//! let key = config.key_provider(&mut rng);
//! let mut client = ClientConnection::new(Instant::now(), &config, key, rng).unwrap();
//!
//! let hello = client.poll_transmit().unwrap();
//! assert_eq!(PacketKind::from_tag(&hello.payload), Some(PacketKind::Hello));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;

pub mod crypto;

pub mod transport;

pub mod client;

pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::crypto::{CountingKey, EphemeralKey, Keypair};

    pub use crate::transport::{
        AddressPolicy, CongestionChoice, Extension, MessageFrame, PacketKind, PeerIdentity,
        ReliableStream, Resolution, StreamEvent, Transmit, WriteId,
    };

    #[cfg(any(feature = "client", feature = "server"))]
    pub use crate::transport::CurveCpStream;

    pub use crate::client::{
        ClientConfig, ClientConnection, ClientEvent, ClientState, CurveCpClientBuilder,
    };

    #[cfg(feature = "client")]
    pub use crate::client::CurveCpClient;

    pub use crate::server::{
        ConnectionId, CurveCpServerBuilder, ServerConfig, ServerConnection, ServerDispatcher,
        ServerEvent,
    };

    #[cfg(feature = "server")]
    pub use crate::server::CurveCpServer;
}

pub use core::{CurveCpError, CurveCpResult};

#[cfg(any(feature = "client", feature = "server"))]
pub use transport::CurveCpStream;

#[cfg(test)]
mod test {
    use tracing_subscriber::EnvFilter;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init()
            .ok();
    }
}
