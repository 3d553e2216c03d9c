//! CurveCP cryptography
//!
//! - [`Keypair`] and the [`KeyProvider`](crate::core::KeyProvider) implementations
//! - [`PeerBox`]: curve25519-xsalsa20-poly1305 boxes with domain-separated nonces
//! - [`CookieKey`]: the server-local secretbox that makes cookies self-validating
//! - [`NonceCounter`] / [`ReplayGuard`]: outbound counters and inbound replay defence

mod boxes;
mod keys;
mod nonce;

pub use boxes::*;
pub use keys::*;
pub use nonce::*;
