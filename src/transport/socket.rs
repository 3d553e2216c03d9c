//! Async UDP socket wrapper for CurveCP endpoints.
//!
//! Owns the receive buffer so the endpoint loops can hand datagrams to the
//! sans-IO state machines without extra copies.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::trace;

use crate::core::MAX_DATAGRAM_SIZE;

use super::Transmit;

/// Async UDP socket for CurveCP packets.
#[derive(Debug)]
pub struct CurveCpSocket {
    socket: UdpSocket,
    recv_buffer: Vec<u8>,
}

impl CurveCpSocket {
    /// Bind a socket to `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        trace!(len = data.len(), %addr, "datagram sent");
        self.socket.send_to(data, addr).await
    }

    /// Send a queued transmit.
    pub async fn send_transmit(&self, transmit: &Transmit) -> io::Result<usize> {
        self.send_to(&transmit.payload, transmit.destination).await
    }

    /// Receive one datagram and the sender's address.
    ///
    /// Datagrams longer than [`MAX_DATAGRAM_SIZE`] are truncated by the OS and
    /// will fail packet validation.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        trace!(len, %addr, "datagram received");
        Ok((&self.recv_buffer[..len], addr))
    }
}

/// Parking distance for endpoint loops with no pending timer.
const IDLE_PARK: Duration = Duration::from_secs(3600);

/// Convert a state-machine deadline for `tokio::time::sleep_until`.
pub(crate) fn sleep_deadline(deadline: Option<Instant>) -> tokio::time::Instant {
    match deadline {
        Some(at) => tokio::time::Instant::from_std(at),
        None => tokio::time::Instant::now() + IDLE_PARK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = CurveCpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[tokio::test]
    async fn test_socket_send_transmit() {
        let mut server = CurveCpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = CurveCpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let transmit = Transmit {
            destination: server_addr,
            payload: b"QvnQ5XlH".to_vec(),
        };
        client.send_transmit(&transmit).await.unwrap();

        let (received, from) = server.recv_from().await.unwrap();
        assert_eq!(received, b"QvnQ5XlH");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
