//! CurveCP Transport Layer
//!
//! Everything between the crypto primitives and the endpoints:
//!
//! - **Interval sets**: [`IntervalSet`] for send/receive/ack bookkeeping
//! - **Message frames**: [`MessageFrame`] with the delta/span range encoding
//! - **Wire packets**: [`HelloPacket`], [`CookiePacket`], [`InitiatePacket`]
//!   and the two message packets
//! - **Congestion control**: the [`congestion::CongestionController`] trait
//!   with the Chicago and Remy controllers
//! - **Reliable stream**: [`ReliableStream`], sans-IO
//! - **Handshake retries**: [`MultiTimeout`]
//! - **Async sockets**: [`CurveCpSocket`] and the [`CurveCpStream`] handle
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Application (CurveCpStream)       │
//! ├─────────────────────────────────────────┤
//! │   ReliableStream + CongestionController │
//! ├─────────────────────────────────────────┤
//! │           MessageFrame codec            │
//! ├─────────────────────────────────────────┤
//! │     Wire packets + boxes (crypto)       │
//! ├─────────────────────────────────────────┤
//! │                 UDP                     │
//! └─────────────────────────────────────────┘
//! ```

mod address;
pub mod congestion;
mod interval;
mod message;
mod packet;
mod stream;
mod timer;

#[cfg(any(feature = "client", feature = "server"))]
mod handle;
#[cfg(any(feature = "client", feature = "server"))]
mod socket;

pub use address::*;
pub use congestion::{Chicago, CongestionController, Remy, WhiskerTree};
pub use interval::*;
pub use message::*;
pub use packet::*;
pub use stream::*;
pub use timer::*;

#[cfg(any(feature = "client", feature = "server"))]
pub use handle::CurveCpStream;
#[cfg(any(feature = "client", feature = "server"))]
pub(crate) use handle::{Command, StreamCommand, StreamDriver};
#[cfg(any(feature = "client", feature = "server"))]
pub use socket::CurveCpSocket;
#[cfg(any(feature = "client", feature = "server"))]
pub(crate) use socket::sleep_deadline;
