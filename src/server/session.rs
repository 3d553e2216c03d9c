//! Server-side connection state.
//!
//! A [`ServerConnection`] exists from the first valid Initiate until its
//! stream finishes. It is bound to one client short-term key; packets for it
//! are routed by [`ConnectionId`].

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::core::{CurveCpResult, EXTENSION_SIZE, PUBLIC_KEY_SIZE, PacketError};
use crate::crypto::{NonceCounter, NoncePrefix, PeerBox, ReplayGuard, decode_short_nonce};
use crate::transport::{
    AddressPolicy, CONNECTION_ID_SIZE, ClientMessagePacket, CongestionController, Extension,
    InitiateContents, InitiatePacket, MessageFrame, PacketKind, PeerIdentity, ReliableStream,
    ServerMessagePacket, StreamEvent, Transmit, WriteId,
};

/// Routing key of a client: server extension, client extension and client
/// short-term public key, exactly as they appear at bytes 8..72 of every
/// client packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; CONNECTION_ID_SIZE]);

impl ConnectionId {
    /// Create a connection id from bytes.
    pub fn new(bytes: [u8; CONNECTION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the id as bytes.
    pub fn as_bytes(&self) -> &[u8; CONNECTION_ID_SIZE] {
        &self.0
    }

    /// Server extension part.
    pub fn server_extension(&self) -> Extension {
        let mut ext = [0u8; EXTENSION_SIZE];
        ext.copy_from_slice(&self.0[..EXTENSION_SIZE]);
        ext
    }

    /// Client extension part.
    pub fn client_extension(&self) -> Extension {
        let mut ext = [0u8; EXTENSION_SIZE];
        ext.copy_from_slice(&self.0[EXTENSION_SIZE..2 * EXTENSION_SIZE]);
        ext
    }

    /// Client short-term public key part.
    pub fn client_short_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&self.0[2 * EXTENSION_SIZE..]);
        key
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[2 * EXTENSION_SIZE..2 * EXTENSION_SIZE + 8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

/// What the dispatcher learned from a valid Initiate.
pub(crate) struct Accepted {
    pub(crate) id: ConnectionId,
    pub(crate) client_long: [u8; PUBLIC_KEY_SIZE],
    pub(crate) server_long: [u8; PUBLIC_KEY_SIZE],
    pub(crate) domain: String,
    pub(crate) session: PeerBox,
    pub(crate) initiate_nonce: u64,
    pub(crate) address: SocketAddr,
}

/// One negotiated client.
pub struct ServerConnection {
    id: ConnectionId,
    client_long: [u8; PUBLIC_KEY_SIZE],
    server_long: [u8; PUBLIC_KEY_SIZE],
    domain: String,
    session: PeerBox,
    initiate_nonce: u64,
    outbound: NonceCounter,
    replay: ReplayGuard,
    peer_addr: SocketAddr,
    policy: AddressPolicy,
    stream: ReliableStream,
    transmits: VecDeque<Transmit>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("peer_addr", &self.peer_addr)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub(crate) fn new(
        now: Instant,
        accepted: Accepted,
        policy: AddressPolicy,
        congestion: Box<dyn CongestionController>,
    ) -> Self {
        let mut replay = ReplayGuard::new();
        replay.commit(accepted.initiate_nonce);
        Self {
            id: accepted.id,
            client_long: accepted.client_long,
            server_long: accepted.server_long,
            domain: accepted.domain,
            session: accepted.session,
            initiate_nonce: accepted.initiate_nonce,
            outbound: NonceCounter::new(),
            replay,
            peer_addr: accepted.address,
            policy,
            stream: ReliableStream::new(now, congestion),
            transmits: VecDeque::new(),
        }
    }

    /// Routing key.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The client.
    pub fn peer(&self) -> PeerIdentity {
        PeerIdentity {
            client_extension: self.id.client_extension(),
            server_extension: self.id.server_extension(),
            domain: self.domain.clone(),
            long_term_key: self.client_long,
            address: self.peer_addr,
        }
    }

    /// This server, bound at `address`.
    pub fn local(&self, address: SocketAddr) -> PeerIdentity {
        PeerIdentity {
            long_term_key: self.server_long,
            address,
            ..self.peer()
        }
    }

    /// The stream.
    pub fn stream(&self) -> &ReliableStream {
        &self.stream
    }

    /// True once both stream directions are closed.
    pub fn is_finished(&self) -> bool {
        self.stream.is_finished()
    }

    /// Process a client packet routed to this connection.
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        source: SocketAddr,
        datagram: &[u8],
    ) -> CurveCpResult<()> {
        match PacketKind::from_tag(datagram) {
            Some(PacketKind::ClientMessage) => self.handle_message(now, source, datagram),
            Some(PacketKind::Initiate) => self.handle_initiate(now, source, datagram),
            Some(kind) => Err(PacketError::Unexpected(kind.name()).into()),
            None => Err(PacketError::UnknownTag.into()),
        }
    }

    /// Feed the frame embedded in the Initiate that created this connection.
    pub(crate) fn accept_frame(&mut self, now: Instant, frame: MessageFrame) {
        self.stream.handle_frame(now, frame);
        self.flush();
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.stream.handle_timeout(now);
        self.flush();
    }

    /// Earliest instant at which [`ServerConnection::handle_timeout`] has
    /// work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.stream.poll_timeout()
    }

    /// Next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next stream event.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.stream.poll_event()
    }

    /// Queue bytes on the stream.
    pub fn write(&mut self, now: Instant, data: &[u8]) -> CurveCpResult<WriteId> {
        Ok(self.stream.write(now, data)?)
    }

    /// Close the stream's write direction.
    pub fn close(&mut self, now: Instant, success: bool) -> CurveCpResult<WriteId> {
        Ok(self.stream.close(now, success)?)
    }

    fn handle_message(
        &mut self,
        now: Instant,
        source: SocketAddr,
        datagram: &[u8],
    ) -> CurveCpResult<()> {
        let packet = ClientMessagePacket::decode(datagram)?;
        self.expect_sender(&packet.server_ext, &packet.client_ext, &packet.client_short)?;

        let nonce = decode_short_nonce(&packet.nonce);
        self.replay.check(nonce)?;
        let plaintext = self
            .session
            .open(NoncePrefix::ClientMessage, &packet.nonce, &packet.boxed)?;
        self.replay.commit(nonce);
        self.peer_addr = self.policy.apply(self.peer_addr, source);
        trace!(id = %self.id, nonce, len = datagram.len(), "message accepted");

        let frame = MessageFrame::unpack(&plaintext)?;
        self.stream.handle_frame(now, frame);
        self.flush();
        Ok(())
    }

    /// A retransmitted Initiate: the client has not seen our reply yet.
    fn handle_initiate(
        &mut self,
        now: Instant,
        source: SocketAddr,
        datagram: &[u8],
    ) -> CurveCpResult<()> {
        let packet = InitiatePacket::decode(datagram)?;
        self.expect_sender(&packet.server_ext, &packet.client_ext, &packet.client_short)?;

        let nonce = decode_short_nonce(&packet.nonce);
        let repeat = nonce == self.initiate_nonce;
        if !repeat {
            self.replay.check(nonce)?;
        }
        let plaintext = self
            .session
            .open(NoncePrefix::ClientInitiate, &packet.nonce, &packet.boxed)?;
        let contents = InitiateContents::decode(&plaintext)?;
        if contents.client_long != self.client_long {
            return Err(PacketError::KeyMismatch.into());
        }
        if !repeat {
            self.replay.commit(nonce);
        }
        self.peer_addr = self.policy.apply(self.peer_addr, source);
        debug!(id = %self.id, nonce, "retransmitted initiate");

        let frame = MessageFrame::unpack(&contents.message)?;
        self.stream.handle_frame(now, frame);
        self.flush();
        Ok(())
    }

    fn expect_sender(
        &self,
        server_ext: &Extension,
        client_ext: &Extension,
        client_short: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<(), PacketError> {
        if *server_ext != self.id.server_extension() || *client_ext != self.id.client_extension()
        {
            return Err(PacketError::ExtensionMismatch);
        }
        if *client_short != self.id.client_short_key() {
            return Err(PacketError::KeyMismatch);
        }
        Ok(())
    }

    fn flush(&mut self) {
        while let Some(frame) = self.stream.poll_frame() {
            match self.seal(&frame) {
                Ok(payload) => self.transmits.push_back(Transmit {
                    destination: self.peer_addr,
                    payload,
                }),
                Err(e) => warn!(id = %self.id, error = %e, "failed to seal message"),
            }
        }
    }

    fn seal(&mut self, frame: &MessageFrame) -> CurveCpResult<Vec<u8>> {
        let plaintext = frame.pack()?;
        let nonce = self.outbound.next_bytes()?;
        let boxed = self
            .session
            .seal(NoncePrefix::ServerMessage, &nonce, &plaintext)?;
        let packet = ServerMessagePacket {
            client_ext: self.id.client_extension(),
            server_ext: self.id.server_extension(),
            nonce,
            boxed,
        };
        Ok(packet.encode())
    }
}
