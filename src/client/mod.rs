//! CurveCP client.
//!
//! [`ClientConnection`] is the sans-IO handshake and stream machine;
//! [`CurveCpClient`] drives one over a tokio UDP socket.

#[cfg(feature = "client")]
#[allow(clippy::module_inception)]
mod client;
mod config;
mod connection;

#[cfg(feature = "client")]
pub use client::*;
pub use config::*;
pub use connection::*;
