//! Sans-IO server endpoint.
//!
//! The dispatcher answers Hellos with Cookies without keeping any state per
//! client, turns valid Initiates into [`ServerConnection`]s and routes every
//! later client packet by its [`ConnectionId`].
//!
//! Packet handling order:
//! 1. Length prefilter (80..=1184 bytes, multiple of 16)
//! 2. Server extension filter, when configured
//! 3. Hello: Cookie reply
//! 4. Known connection id: hand to the connection
//! 5. Initiate: cookie check, vouch check, new connection

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use crypto_box::PublicKey;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, trace, warn};
use zeroize::Zeroize;

use crate::core::{
    COOKIE_SIZE, CryptoError, CurveCpError, CurveCpResult, KeyProvider, LONG_NONCE_SIZE,
    PUBLIC_KEY_SIZE, PacketError, StreamError,
};
use crate::crypto::{CookieKey, Keypair, NoncePrefix, PeerBox, decode_short_nonce};
use crate::transport::{
    AddressPolicy, CongestionChoice, CookieContents, CookiePacket, Extension, HelloPacket,
    InitiateContents, InitiatePacket, MessageFrame, PacketKind, PeerIdentity, StreamEvent,
    Transmit, WriteId, connection_id, decode_domain, is_plausible_client_datagram,
};

use super::config::ServerConfig;
use super::session::{Accepted, ConnectionId, ServerConnection};

/// Something the application should learn about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client completed the handshake.
    Accepted {
        /// Routing key of the new connection.
        id: ConnectionId,
        /// The client.
        peer: PeerIdentity,
    },
    /// A stream event on one connection.
    Stream {
        /// Connection the event belongs to.
        id: ConnectionId,
        /// The event.
        event: StreamEvent,
    },
    /// A finished connection was removed.
    Closed {
        /// Connection that was removed.
        id: ConnectionId,
    },
}

/// Recent Cookie replies keyed by the Hello that produced them, so a
/// retransmitted Hello gets the same cookie back.
#[derive(Debug)]
struct CookieCache {
    capacity: usize,
    order: VecDeque<Vec<u8>>,
    replies: HashMap<Vec<u8>, Vec<u8>>,
}

impl CookieCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            replies: HashMap::new(),
        }
    }

    fn get(&self, hello: &[u8]) -> Option<&Vec<u8>> {
        self.replies.get(hello)
    }

    fn insert(&mut self, hello: Vec<u8>, reply: Vec<u8>) {
        if self.capacity == 0 || self.replies.contains_key(&hello) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
        self.order.push_back(hello.clone());
        self.replies.insert(hello, reply);
    }

    fn len(&self) -> usize {
        self.replies.len()
    }
}

/// Every connection of one server socket.
pub struct ServerDispatcher {
    key: Box<dyn KeyProvider>,
    cookie_key: CookieKey,
    extension: Option<Extension>,
    policy: AddressPolicy,
    congestion: CongestionChoice,
    max_connections: usize,
    cookies: CookieCache,
    connections: HashMap<ConnectionId, ServerConnection>,
    rng: StdRng,
    transmits: VecDeque<Transmit>,
    events: VecDeque<ServerEvent>,
}

impl std::fmt::Debug for ServerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDispatcher")
            .field("connections", &self.connections.len())
            .field("cookies", &self.cookies.len())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl ServerDispatcher {
    /// Create a dispatcher with a fresh cookie key.
    pub fn new(config: &ServerConfig, key: Box<dyn KeyProvider>, mut rng: StdRng) -> Self {
        let cookie_key = CookieKey::generate(&mut rng);
        Self {
            key,
            cookie_key,
            extension: config.extension,
            policy: config.address_policy,
            congestion: config.congestion.clone(),
            max_connections: config.max_connections,
            cookies: CookieCache::new(config.cookie_cache_size),
            connections: HashMap::new(),
            rng,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// The server's long-term public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.key.keypair().public_bytes()
    }

    /// Look up a live connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<&ServerConnection> {
        self.connections.get(id)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Process one inbound datagram. Invalid packets are dropped silently.
    pub fn handle_datagram(&mut self, now: Instant, source: SocketAddr, datagram: &[u8]) {
        if !is_plausible_client_datagram(datagram.len()) {
            trace!(len = datagram.len(), %source, "implausible datagram size");
            return;
        }
        if let Err(e) = self.dispatch(now, source, datagram) {
            drop_datagram(&e, source);
        }
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        let due: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.poll_timeout().is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.handle_timeout(now);
            }
            self.drain(id);
        }
    }

    /// Earliest instant at which [`ServerDispatcher::handle_timeout`] has
    /// work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(ServerConnection::poll_timeout)
            .min()
    }

    /// Next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next application event.
    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Queue bytes on one connection's stream.
    pub fn write(
        &mut self,
        now: Instant,
        id: &ConnectionId,
        data: &[u8],
    ) -> CurveCpResult<WriteId> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(StreamError::ConnectionDone)?;
        let result = conn.write(now, data);
        self.drain(*id);
        result
    }

    /// Close one connection's write direction.
    pub fn close(
        &mut self,
        now: Instant,
        id: &ConnectionId,
        success: bool,
    ) -> CurveCpResult<WriteId> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(StreamError::ConnectionDone)?;
        let result = conn.close(now, success);
        self.drain(*id);
        result
    }

    fn dispatch(&mut self, now: Instant, source: SocketAddr, datagram: &[u8]) -> CurveCpResult<()> {
        let kind = PacketKind::from_tag(datagram).ok_or(PacketError::UnknownTag)?;
        if !kind.is_client_packet() {
            return Err(PacketError::Unexpected(kind.name()).into());
        }
        let id = connection_id(datagram).map(ConnectionId::new).ok_or(
            PacketError::WrongLength {
                expected: crate::core::MIN_CLIENT_DATAGRAM,
                actual: datagram.len(),
            },
        )?;
        if let Some(ext) = &self.extension {
            if id.server_extension() != *ext {
                return Err(PacketError::ExtensionMismatch.into());
            }
        }

        if kind == PacketKind::Hello {
            return self.handle_hello(source, datagram);
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            let result = conn.handle_datagram(now, source, datagram);
            self.drain(id);
            return result;
        }
        if kind == PacketKind::Initiate {
            return self.accept(now, source, id, datagram);
        }
        Err(PacketError::Unexpected(kind.name()).into())
    }

    fn handle_hello(&mut self, source: SocketAddr, datagram: &[u8]) -> CurveCpResult<()> {
        if let Some(reply) = self.cookies.get(datagram) {
            trace!(%source, "repeated hello, replaying cookie");
            self.transmits.push_back(Transmit {
                destination: source,
                payload: reply.clone(),
            });
            return Ok(());
        }

        let hello = HelloPacket::decode(datagram)?;
        let long_box = PeerBox::new(
            &PublicKey::from(hello.client_short),
            self.key.keypair().secret_key(),
        );
        long_box.open(NoncePrefix::ClientHello, &hello.nonce, &hello.boxed)?;

        let server_short = Keypair::generate(&mut self.rng);
        let nonce = self.key.nonce(true);
        let cookie = self.mint_cookie(&nonce, &hello.client_short, &server_short)?;
        let contents = CookieContents {
            server_short: *server_short.public_bytes(),
            cookie,
        };
        let boxed = long_box.seal(NoncePrefix::Cookie, &nonce, &contents.encode())?;
        let packet = CookiePacket {
            client_ext: hello.client_ext,
            server_ext: hello.server_ext,
            nonce,
            boxed: fixed(&boxed)?,
        };
        let payload = packet.encode();
        self.cookies.insert(datagram.to_vec(), payload.clone());
        self.transmits.push_back(Transmit {
            destination: source,
            payload,
        });
        debug!(%source, "cookie sent");
        Ok(())
    }

    /// A cookie is `nonce || secretbox(client short key || server short secret)`.
    fn mint_cookie(
        &self,
        nonce: &[u8; LONG_NONCE_SIZE],
        client_short: &[u8; PUBLIC_KEY_SIZE],
        server_short: &Keypair,
    ) -> CurveCpResult<[u8; COOKIE_SIZE]> {
        let mut plaintext = Vec::with_capacity(2 * PUBLIC_KEY_SIZE);
        plaintext.extend_from_slice(client_short);
        plaintext.extend_from_slice(&server_short.secret_bytes());
        let sealed = self.cookie_key.seal(nonce, &plaintext);
        plaintext.zeroize();

        let mut cookie = Vec::with_capacity(COOKIE_SIZE);
        cookie.extend_from_slice(nonce);
        cookie.extend_from_slice(&sealed?);
        Ok(fixed(&cookie)?)
    }

    /// Recover the server short-term key from a cookie minted for
    /// `client_short`.
    fn open_cookie(
        &self,
        cookie: &[u8; COOKIE_SIZE],
        client_short: &[u8; PUBLIC_KEY_SIZE],
    ) -> CurveCpResult<Keypair> {
        let (nonce, sealed) = cookie.split_at(LONG_NONCE_SIZE);
        let mut plaintext = self.cookie_key.open(nonce, sealed)?;
        if plaintext.len() != 2 * PUBLIC_KEY_SIZE {
            plaintext.zeroize();
            return Err(CryptoError::InvalidKey.into());
        }
        if plaintext[..PUBLIC_KEY_SIZE] != client_short[..] {
            plaintext.zeroize();
            return Err(PacketError::KeyMismatch.into());
        }
        let mut secret: [u8; PUBLIC_KEY_SIZE] = fixed(&plaintext[PUBLIC_KEY_SIZE..])?;
        plaintext.zeroize();
        let keypair = Keypair::from_secret_bytes(secret);
        secret.zeroize();
        Ok(keypair)
    }

    fn accept(
        &mut self,
        now: Instant,
        source: SocketAddr,
        id: ConnectionId,
        datagram: &[u8],
    ) -> CurveCpResult<()> {
        if self.connections.len() >= self.max_connections {
            debug!(%id, %source, max = self.max_connections, "connection limit reached");
            return Ok(());
        }

        let packet = InitiatePacket::decode(datagram)?;
        let server_short = self.open_cookie(&packet.cookie, &packet.client_short)?;
        let session = PeerBox::new(
            &PublicKey::from(packet.client_short),
            server_short.secret_key(),
        );
        let plaintext = session.open(NoncePrefix::ClientInitiate, &packet.nonce, &packet.boxed)?;
        let contents = InitiateContents::decode(&plaintext)?;

        let vouch_box = PeerBox::new(
            &PublicKey::from(contents.client_long),
            self.key.keypair().secret_key(),
        );
        let vouched = vouch_box.open(NoncePrefix::Vouch, &contents.vouch_nonce, &contents.vouch)?;
        if vouched[..] != packet.client_short[..] {
            return Err(PacketError::KeyMismatch.into());
        }
        let frame = MessageFrame::unpack(&contents.message)?;

        let accepted = Accepted {
            id,
            client_long: contents.client_long,
            server_long: self.public_key(),
            domain: decode_domain(&contents.domain),
            session,
            initiate_nonce: decode_short_nonce(&packet.nonce),
            address: source,
        };
        let rng = StdRng::seed_from_u64(self.rng.next_u64());
        let mut conn = ServerConnection::new(
            now,
            accepted,
            self.policy,
            self.congestion.build(now, rng),
        );
        info!(%id, peer = %source, "connection accepted");
        self.events.push_back(ServerEvent::Accepted {
            id,
            peer: conn.peer(),
        });
        conn.accept_frame(now, frame);
        self.connections.insert(id, conn);
        self.drain(id);
        Ok(())
    }

    /// Move a connection's output into the dispatcher queues and remove it
    /// once it has finished.
    fn drain(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        while let Some(transmit) = conn.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        while let Some(event) = conn.poll_event() {
            self.events.push_back(ServerEvent::Stream { id, event });
        }
        if conn.is_finished() {
            let resolution = conn.stream().their_resolution();
            self.connections.remove(&id);
            info!(%id, ?resolution, "connection finished");
            self.events.push_back(ServerEvent::Closed { id });
        }
    }
}

/// Copy bytes into a fixed-size wire field.
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
