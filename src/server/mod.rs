//! CurveCP server.
//!
//! [`ServerDispatcher`] is the sans-IO endpoint that owns every
//! [`ServerConnection`]; [`CurveCpServer`] drives one over a tokio UDP socket.

mod config;
mod dispatcher;
#[cfg(feature = "server")]
#[allow(clippy::module_inception)]
mod server;
mod session;

pub use config::*;
pub use dispatcher::*;
#[cfg(feature = "server")]
pub use server::*;
pub use session::*;
