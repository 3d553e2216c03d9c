//! Sans-IO client connection.
//!
//! Drives the handshake (Hello, Cookie, Initiate) and then carries the
//! reliable stream inside client Message packets. The caller feeds datagrams
//! and timer ticks and drains [`Transmit`]s and [`ClientEvent`]s.
//!
//! ```text
//!  AwaitingCookie ──cookie──► AwaitingFirstMessage ──message──► Negotiated
//!        │                           │                              │
//!        └─────── expiry ────────────┴──► Failed          finished ─┴─► Finished
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crypto_box::PublicKey;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::core::{
    COOKIE_SIZE, CryptoError, CurveCpError, CurveCpResult, DOMAIN_SIZE, HELLO_PADDING_SIZE,
    HandshakeError, KeyProvider, PUBLIC_KEY_SIZE, PacketError,
};
use crate::crypto::{Keypair, NonceCounter, NoncePrefix, PeerBox, ReplayGuard, decode_short_nonce};
use crate::transport::{
    AddressPolicy, ClientMessagePacket, CongestionChoice, CookieContents, CookiePacket, Extension,
    HelloPacket, InitiateContents, InitiatePacket, MessageFrame, MultiTimeout, PacketKind,
    PeerIdentity, ReliableStream, RetryAction, ServerMessagePacket, StreamEvent, Transmit, WriteId,
    encode_domain,
};

use super::config::ClientConfig;

/// Message id of the frame embedded in the Initiate.
const INITIATE_MESSAGE_ID: u32 = 1;

/// Handshake progress of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Hello sent, waiting for a Cookie.
    AwaitingCookie,
    /// Initiate sent, waiting for the server's first Message.
    AwaitingFirstMessage,
    /// Handshake complete; the stream is live.
    Negotiated,
    /// The handshake timed out.
    Failed,
    /// Both stream directions are closed.
    Finished,
}

/// Something the application should learn about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server's first Message arrived.
    Established(PeerIdentity),
    /// A stream event.
    Stream(StreamEvent),
    /// The handshake could not be completed.
    HandshakeFailed(HandshakeError),
}

/// One client connection, from Hello to the end of the stream.
pub struct ClientConnection {
    state: ClientState,
    key: Box<dyn KeyProvider>,
    server_long: PublicKey,
    server_long_bytes: [u8; PUBLIC_KEY_SIZE],
    server_ext: Extension,
    client_ext: Extension,
    domain: String,
    domain_field: [u8; DOMAIN_SIZE],

    short: Keypair,
    short_long: PeerBox,
    session: Option<PeerBox>,
    server_short: Option<[u8; PUBLIC_KEY_SIZE]>,
    cookie: Option<[u8; COOKIE_SIZE]>,

    outbound: NonceCounter,
    replay: ReplayGuard,
    retry: MultiTimeout,
    handshake_packet: Vec<u8>,

    peer_addr: SocketAddr,
    policy: AddressPolicy,
    congestion: CongestionChoice,
    rng: StdRng,
    stream: Option<ReliableStream>,

    transmits: VecDeque<Transmit>,
    events: VecDeque<ClientEvent>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("state", &self.state)
            .field("domain", &self.domain)
            .field("peer_addr", &self.peer_addr)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Start a connection: generates the short-term key and queues the Hello.
    pub fn new(
        now: Instant,
        config: &ClientConfig,
        key: Box<dyn KeyProvider>,
        mut rng: StdRng,
    ) -> CurveCpResult<Self> {
        let domain_field = encode_domain(&config.domain)?;
        let server_long = PublicKey::from(config.server_public_key);
        let short = Keypair::generate(&mut rng);
        let short_long = PeerBox::new(&server_long, short.secret_key());

        let mut conn = Self {
            state: ClientState::AwaitingCookie,
            key,
            server_long,
            server_long_bytes: config.server_public_key,
            server_ext: config.server_extension,
            client_ext: config.client_extension,
            domain: config.domain.clone(),
            domain_field,
            short,
            short_long,
            session: None,
            server_short: None,
            cookie: None,
            outbound: NonceCounter::new(),
            replay: ReplayGuard::new(),
            retry: MultiTimeout::new(config.retry_schedule.clone()),
            handshake_packet: Vec::new(),
            peer_addr: config.server_addr,
            policy: config.address_policy,
            congestion: config.congestion.clone(),
            rng,
            stream: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        };
        conn.send_hello(now)?;
        Ok(conn)
    }

    /// Current handshake state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The server as currently known.
    pub fn peer(&self) -> PeerIdentity {
        PeerIdentity {
            client_extension: self.client_ext,
            server_extension: self.server_ext,
            domain: self.domain.clone(),
            long_term_key: self.server_long_bytes,
            address: self.peer_addr,
        }
    }

    /// This client, bound at `address`.
    pub fn local(&self, address: SocketAddr) -> PeerIdentity {
        PeerIdentity {
            long_term_key: *self.key.keypair().public_bytes(),
            address,
            ..self.peer()
        }
    }

    /// The stream, once negotiated.
    pub fn stream(&self) -> Option<&ReliableStream> {
        self.stream.as_ref()
    }

    /// Process one inbound datagram. Invalid packets are dropped silently.
    pub fn handle_datagram(&mut self, now: Instant, source: SocketAddr, datagram: &[u8]) {
        let result = match PacketKind::from_tag(datagram) {
            Some(PacketKind::Cookie) => self.handle_cookie(now, source, datagram),
            Some(PacketKind::ServerMessage) => self.handle_message(now, source, datagram),
            Some(kind) => Err(PacketError::Unexpected(kind.name()).into()),
            None => Err(PacketError::UnknownTag.into()),
        };
        if let Err(e) = result {
            drop_datagram(&e, source);
        }
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(action) = self.retry.poll_due(now) {
            match action {
                RetryAction::Resend => {
                    debug!(state = ?self.state, "resending handshake packet");
                    self.transmit_handshake();
                }
                RetryAction::Expired => {
                    warn!(
                        state = ?self.state,
                        peer = %self.peer_addr,
                        after = ?self.retry.total(),
                        "handshake timed out"
                    );
                    self.state = ClientState::Failed;
                    self.handshake_packet.clear();
                    self.events
                        .push_back(ClientEvent::HandshakeFailed(HandshakeError::Timeout));
                    return;
                }
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            stream.handle_timeout(now);
        }
        self.flush_stream();
    }

    /// Earliest instant at which [`ClientConnection::handle_timeout`] has
    /// work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state == ClientState::Failed {
            return None;
        }
        let stream = self.stream.as_ref().and_then(ReliableStream::poll_timeout);
        self.retry.poll_timeout().into_iter().chain(stream).min()
    }

    /// Next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next application event.
    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// Queue bytes on the stream.
    pub fn write(&mut self, now: Instant, data: &[u8]) -> CurveCpResult<WriteId> {
        let stream = self.stream.as_mut().ok_or(HandshakeError::NotEstablished)?;
        Ok(stream.write(now, data)?)
    }

    /// Close the stream's write direction.
    pub fn close(&mut self, now: Instant, success: bool) -> CurveCpResult<WriteId> {
        let stream = self.stream.as_mut().ok_or(HandshakeError::NotEstablished)?;
        Ok(stream.close(now, success)?)
    }

    fn send_hello(&mut self, now: Instant) -> CurveCpResult<()> {
        let nonce = self.outbound.next_bytes()?;
        let boxed = self
            .short_long
            .seal(NoncePrefix::ClientHello, &nonce, &[0u8; HELLO_PADDING_SIZE])?;
        let hello = HelloPacket {
            server_ext: self.server_ext,
            client_ext: self.client_ext,
            client_short: *self.short.public_bytes(),
            nonce,
            boxed: fixed(&boxed)?,
        };
        self.handshake_packet = hello.encode();
        self.transmit_handshake();
        self.retry.reset(now);
        trace!(peer = %self.peer_addr, "hello sent");
        Ok(())
    }

    fn handle_cookie(
        &mut self,
        now: Instant,
        source: SocketAddr,
        datagram: &[u8],
    ) -> CurveCpResult<()> {
        if !matches!(
            self.state,
            ClientState::AwaitingCookie | ClientState::AwaitingFirstMessage
        ) {
            return Err(PacketError::Unexpected("cookie").into());
        }

        let packet = CookiePacket::decode(datagram)?;
        if packet.client_ext != self.client_ext || packet.server_ext != self.server_ext {
            return Err(PacketError::ExtensionMismatch.into());
        }
        let opened = self
            .short_long
            .open(NoncePrefix::Cookie, &packet.nonce, &packet.boxed)?;
        let contents = CookieContents::decode(&opened)?;

        if let (Some(cookie), Some(server_short)) = (&self.cookie, &self.server_short) {
            if *cookie != contents.cookie || *server_short != contents.server_short {
                return Err(PacketError::KeyMismatch.into());
            }
            self.peer_addr = self.policy.apply(self.peer_addr, source);
            debug!("duplicate cookie, restarting initiate retries");
            self.transmit_handshake();
            self.retry.reset(now);
            return Ok(());
        }

        self.peer_addr = self.policy.apply(self.peer_addr, source);
        let session = PeerBox::new(
            &PublicKey::from(contents.server_short),
            self.short.secret_key(),
        );
        let initiate = self.build_initiate(&session, &contents.cookie)?;

        self.session = Some(session);
        self.server_short = Some(contents.server_short);
        self.cookie = Some(contents.cookie);
        self.handshake_packet = initiate;
        self.retry.cancel();
        self.transmit_handshake();
        self.retry.reset(now);
        self.state = ClientState::AwaitingFirstMessage;
        debug!(peer = %self.peer_addr, "cookie accepted, initiate sent");
        Ok(())
    }

    fn build_initiate(
        &mut self,
        session: &PeerBox,
        cookie: &[u8; COOKIE_SIZE],
    ) -> CurveCpResult<Vec<u8>> {
        let first = MessageFrame {
            id: INITIATE_MESSAGE_ID,
            ..MessageFrame::default()
        };

        let vouch_nonce = self.key.nonce(false);
        let long_long = PeerBox::new(&self.server_long, self.key.keypair().secret_key());
        let vouch = long_long.seal(NoncePrefix::Vouch, &vouch_nonce, self.short.public_bytes())?;
        let contents = InitiateContents {
            client_long: *self.key.keypair().public_bytes(),
            vouch_nonce,
            vouch: fixed(&vouch)?,
            domain: self.domain_field,
            message: first.pack()?,
        };

        let nonce = self.outbound.next_bytes()?;
        let boxed = session.seal(NoncePrefix::ClientInitiate, &nonce, &contents.encode())?;
        let packet = InitiatePacket {
            server_ext: self.server_ext,
            client_ext: self.client_ext,
            client_short: *self.short.public_bytes(),
            cookie: *cookie,
            nonce,
            boxed,
        };
        Ok(packet.encode())
    }

    fn handle_message(
        &mut self,
        now: Instant,
        source: SocketAddr,
        datagram: &[u8],
    ) -> CurveCpResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(PacketError::Unexpected("message").into());
        };
        if self.state == ClientState::Failed {
            return Err(PacketError::Unexpected("message").into());
        }

        let packet = ServerMessagePacket::decode(datagram)?;
        if packet.client_ext != self.client_ext || packet.server_ext != self.server_ext {
            return Err(PacketError::ExtensionMismatch.into());
        }
        let nonce = decode_short_nonce(&packet.nonce);
        self.replay.check(nonce)?;
        let plaintext = session.open(NoncePrefix::ServerMessage, &packet.nonce, &packet.boxed)?;
        self.replay.commit(nonce);
        self.peer_addr = self.policy.apply(self.peer_addr, source);
        trace!(nonce, len = datagram.len(), "message accepted");

        let frame = MessageFrame::unpack(&plaintext)?;
        if self.state == ClientState::AwaitingFirstMessage {
            self.establish(now);
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.handle_frame(now, frame);
        }
        self.flush_stream();
        Ok(())
    }

    fn establish(&mut self, now: Instant) {
        self.retry.cancel();
        self.handshake_packet.clear();

        let rng = StdRng::seed_from_u64(self.rng.next_u64());
        let mut stream = ReliableStream::new(now, self.congestion.build(now, rng));
        // The Initiate already used the first id.
        stream.take_message_id();
        self.stream = Some(stream);
        self.state = ClientState::Negotiated;

        info!(peer = %self.peer_addr, domain = %self.domain, "handshake complete");
        self.events.push_back(ClientEvent::Established(self.peer()));
    }

    fn transmit_handshake(&mut self) {
        if self.handshake_packet.is_empty() {
            return;
        }
        self.transmits.push_back(Transmit {
            destination: self.peer_addr,
            payload: self.handshake_packet.clone(),
        });
    }

    fn flush_stream(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let frames: Vec<MessageFrame> = std::iter::from_fn(|| stream.poll_frame()).collect();
        let events: Vec<StreamEvent> = std::iter::from_fn(|| stream.poll_event()).collect();

        for frame in frames {
            match self.seal_message(&frame) {
                Ok(payload) => self.transmits.push_back(Transmit {
                    destination: self.peer_addr,
                    payload,
                }),
                Err(e) => warn!(error = %e, id = frame.id, "failed to seal message"),
            }
        }

        for event in events {
            if let StreamEvent::Finished(resolution) = &event {
                self.state = ClientState::Finished;
                info!(?resolution, peer = %self.peer_addr, "connection finished");
            }
            self.events.push_back(ClientEvent::Stream(event));
        }
    }

    fn seal_message(&mut self, frame: &MessageFrame) -> CurveCpResult<Vec<u8>> {
        let session = self
            .session
            .as_ref()
            .ok_or(HandshakeError::NotEstablished)?;
        let plaintext = frame.pack()?;
        let nonce = self.outbound.next_bytes()?;
        let boxed = session.seal(NoncePrefix::ClientMessage, &nonce, &plaintext)?;
        let packet = ClientMessagePacket {
            server_ext: self.server_ext,
            client_ext: self.client_ext,
            client_short: *self.short.public_bytes(),
            nonce,
            boxed,
        };
        Ok(packet.encode())
    }
}

/// Copy a sealed box into its fixed-size wire field.
fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::EncryptionFailed)
}

fn drop_datagram(error: &CurveCpError, source: SocketAddr) {
    if error.is_silent_drop() {
        debug!(%error, %source, "dropping datagram");
    } else {
        warn!(%error, %source, "failed to process datagram");
    }
}
