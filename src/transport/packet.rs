//! Wire packet layouts.
//!
//! Packets are parsed by position only; nothing here touches keys. The
//! handshake machines open the boxes and validate their contents.
//!
//! ```text
//! Hello          tag | s-ext | c-ext | c-short | zero(64) | nonce(8)  | box(80)
//! Cookie         tag | c-ext | s-ext | nonce(16)                      | box(144)
//! Initiate       tag | s-ext | c-ext | c-short | cookie(96) | nonce(8) | box(..)
//! Client Message tag | s-ext | c-ext | c-short | nonce(8)             | box(..)
//! Server Message tag | c-ext | s-ext | nonce(8)                       | box(..)
//! ```

use crate::core::{
    BOX_TAG_SIZE, CLIENT_MESSAGE_BOX_OFFSET, COOKIE_BOX_SIZE, COOKIE_PACKET_SIZE, COOKIE_SIZE,
    DOMAIN_SIZE, EXTENSION_SIZE, HELLO_BOX_SIZE, HELLO_PACKET_SIZE, HELLO_PADDING_SIZE,
    INITIATE_BOX_OFFSET, INITIATE_INNER_PREFIX_SIZE, LONG_NONCE_SIZE, MAX_CLIENT_DATAGRAM,
    MIN_CLIENT_DATAGRAM, PUBLIC_KEY_SIZE, PacketError, SERVER_MESSAGE_BOX_OFFSET,
    SHORT_NONCE_SIZE, TAG_CLIENT_MESSAGE, TAG_COOKIE, TAG_HELLO, TAG_INITIATE, TAG_SERVER_MESSAGE,
    TAG_SIZE, VOUCH_SIZE,
};

/// A 16-byte extension.
pub type Extension = [u8; EXTENSION_SIZE];

/// Length of a client connection id: server ext, client ext, client short key.
pub const CONNECTION_ID_SIZE: usize = 2 * EXTENSION_SIZE + PUBLIC_KEY_SIZE;

/// The five packet kinds, one per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Client Hello.
    Hello,
    /// Server Cookie.
    Cookie,
    /// Client Initiate.
    Initiate,
    /// Client to server Message.
    ClientMessage,
    /// Server to client Message.
    ServerMessage,
}

impl PacketKind {
    /// The 8-byte tag.
    pub fn tag(self) -> &'static [u8; TAG_SIZE] {
        match self {
            PacketKind::Hello => TAG_HELLO,
            PacketKind::Cookie => TAG_COOKIE,
            PacketKind::Initiate => TAG_INITIATE,
            PacketKind::ClientMessage => TAG_CLIENT_MESSAGE,
            PacketKind::ServerMessage => TAG_SERVER_MESSAGE,
        }
    }

    /// Identify a packet from its leading tag.
    pub fn from_tag(bytes: &[u8]) -> Option<Self> {
        let tag = bytes.get(..TAG_SIZE)?;
        [
            PacketKind::Hello,
            PacketKind::Cookie,
            PacketKind::Initiate,
            PacketKind::ClientMessage,
            PacketKind::ServerMessage,
        ]
        .into_iter()
        .find(|kind| kind.tag().as_slice() == tag)
    }

    /// Lowercase name for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Hello => "hello",
            PacketKind::Cookie => "cookie",
            PacketKind::Initiate => "initiate",
            PacketKind::ClientMessage => "client message",
            PacketKind::ServerMessage => "server message",
        }
    }

    /// True for packets sent by clients.
    pub fn is_client_packet(self) -> bool {
        matches!(
            self,
            PacketKind::Hello | PacketKind::Initiate | PacketKind::ClientMessage
        )
    }
}

/// Cheap length filter applied by servers before any parsing: client
/// datagrams are 80..=1184 bytes and a multiple of 16.
pub fn is_plausible_client_datagram(len: usize) -> bool {
    (MIN_CLIENT_DATAGRAM..=MAX_CLIENT_DATAGRAM).contains(&len) && len % 16 == 0
}

/// The 64-byte connection id of a client packet.
pub fn connection_id(datagram: &[u8]) -> Option<[u8; CONNECTION_ID_SIZE]> {
    let bytes = datagram.get(TAG_SIZE..TAG_SIZE + CONNECTION_ID_SIZE)?;
    let mut id = [0u8; CONNECTION_ID_SIZE];
    id.copy_from_slice(bytes);
    Some(id)
}

fn expect_tag(bytes: &[u8], kind: PacketKind) -> Result<(), PacketError> {
    if PacketKind::from_tag(bytes) == Some(kind) {
        Ok(())
    } else {
        Err(PacketError::UnknownTag)
    }
}

fn expect_len(bytes: &[u8], expected: usize) -> Result<(), PacketError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(PacketError::WrongLength {
            expected,
            actual: bytes.len(),
        })
    }
}

fn expect_min_len(bytes: &[u8], expected: usize) -> Result<(), PacketError> {
    if bytes.len() >= expected {
        Ok(())
    } else {
        Err(PacketError::WrongLength {
            expected,
            actual: bytes.len(),
        })
    }
}

/// Sequential reader over fixed-width fields.
struct Fields<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn after_tag(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: TAG_SIZE,
        }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

/// Client Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPacket {
    /// Server extension.
    pub server_ext: Extension,
    /// Client extension.
    pub client_ext: Extension,
    /// Client short-term public key.
    pub client_short: [u8; PUBLIC_KEY_SIZE],
    /// Short nonce.
    pub nonce: [u8; SHORT_NONCE_SIZE],
    /// 64 zero bytes boxed from client short to server long.
    pub boxed: [u8; HELLO_BOX_SIZE],
}

impl HelloPacket {
    /// Encode to exactly 224 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HELLO_PACKET_SIZE);
        out.extend_from_slice(TAG_HELLO);
        out.extend_from_slice(&self.server_ext);
        out.extend_from_slice(&self.client_ext);
        out.extend_from_slice(&self.client_short);
        out.extend_from_slice(&[0u8; HELLO_PADDING_SIZE]);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.boxed);
        out
    }

    /// Decode a Hello.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_len(bytes, HELLO_PACKET_SIZE)?;
        expect_tag(bytes, PacketKind::Hello)?;
        let mut f = Fields::after_tag(bytes);
        let server_ext = f.take();
        let client_ext = f.take();
        let client_short = f.take();
        f.skip(HELLO_PADDING_SIZE);
        Ok(Self {
            server_ext,
            client_ext,
            client_short,
            nonce: f.take(),
            boxed: f.take(),
        })
    }
}

/// Server Cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePacket {
    /// Client extension.
    pub client_ext: Extension,
    /// Server extension.
    pub server_ext: Extension,
    /// Long nonce.
    pub nonce: [u8; LONG_NONCE_SIZE],
    /// Server short key and cookie, boxed from server long to client short.
    pub boxed: [u8; COOKIE_BOX_SIZE],
}

impl CookiePacket {
    /// Encode to exactly 200 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COOKIE_PACKET_SIZE);
        out.extend_from_slice(TAG_COOKIE);
        out.extend_from_slice(&self.client_ext);
        out.extend_from_slice(&self.server_ext);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.boxed);
        out
    }

    /// Decode a Cookie.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_len(bytes, COOKIE_PACKET_SIZE)?;
        expect_tag(bytes, PacketKind::Cookie)?;
        let mut f = Fields::after_tag(bytes);
        Ok(Self {
            client_ext: f.take(),
            server_ext: f.take(),
            nonce: f.take(),
            boxed: f.take(),
        })
    }
}

/// Plaintext of the Cookie box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieContents {
    /// Server short-term public key.
    pub server_short: [u8; PUBLIC_KEY_SIZE],
    /// Opaque cookie, echoed back in the Initiate.
    pub cookie: [u8; COOKIE_SIZE],
}

impl CookieContents {
    /// Plaintext size.
    pub const SIZE: usize = PUBLIC_KEY_SIZE + COOKIE_SIZE;

    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.server_short);
        out.extend_from_slice(&self.cookie);
        out
    }

    /// Decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_len(bytes, Self::SIZE)?;
        let mut server_short = [0u8; PUBLIC_KEY_SIZE];
        server_short.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Ok(Self {
            server_short,
            cookie,
        })
    }
}

/// Client Initiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatePacket {
    /// Server extension.
    pub server_ext: Extension,
    /// Client extension.
    pub client_ext: Extension,
    /// Client short-term public key.
    pub client_short: [u8; PUBLIC_KEY_SIZE],
    /// Cookie from the server.
    pub cookie: [u8; COOKIE_SIZE],
    /// Short nonce.
    pub nonce: [u8; SHORT_NONCE_SIZE],
    /// [`InitiateContents`] boxed short to short.
    pub boxed: Vec<u8>,
}

impl InitiatePacket {
    /// Smallest valid Initiate: the fixed inner prefix with an empty frame.
    pub const MIN_SIZE: usize = INITIATE_BOX_OFFSET + BOX_TAG_SIZE + INITIATE_INNER_PREFIX_SIZE;

    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INITIATE_BOX_OFFSET + self.boxed.len());
        out.extend_from_slice(TAG_INITIATE);
        out.extend_from_slice(&self.server_ext);
        out.extend_from_slice(&self.client_ext);
        out.extend_from_slice(&self.client_short);
        out.extend_from_slice(&self.cookie);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.boxed);
        out
    }

    /// Decode an Initiate.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_min_len(bytes, Self::MIN_SIZE)?;
        expect_tag(bytes, PacketKind::Initiate)?;
        let mut f = Fields::after_tag(bytes);
        Ok(Self {
            server_ext: f.take(),
            client_ext: f.take(),
            client_short: f.take(),
            cookie: f.take(),
            nonce: f.take(),
            boxed: f.rest().to_vec(),
        })
    }
}

/// Plaintext of the Initiate box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateContents {
    /// Client long-term public key.
    pub client_long: [u8; PUBLIC_KEY_SIZE],
    /// Vouch nonce.
    pub vouch_nonce: [u8; LONG_NONCE_SIZE],
    /// Client short key boxed long to long.
    pub vouch: [u8; VOUCH_SIZE],
    /// Encoded server domain name.
    pub domain: [u8; DOMAIN_SIZE],
    /// Packed first message frame.
    pub message: Vec<u8>,
}

impl InitiateContents {
    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INITIATE_INNER_PREFIX_SIZE + self.message.len());
        out.extend_from_slice(&self.client_long);
        out.extend_from_slice(&self.vouch_nonce);
        out.extend_from_slice(&self.vouch);
        out.extend_from_slice(&self.domain);
        out.extend_from_slice(&self.message);
        out
    }

    /// Decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_min_len(bytes, INITIATE_INNER_PREFIX_SIZE)?;
        let mut f = Fields { bytes, pos: 0 };
        Ok(Self {
            client_long: f.take(),
            vouch_nonce: f.take(),
            vouch: f.take(),
            domain: f.take(),
            message: f.rest().to_vec(),
        })
    }
}

/// Client to server Message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessagePacket {
    /// Server extension.
    pub server_ext: Extension,
    /// Client extension.
    pub client_ext: Extension,
    /// Client short-term public key.
    pub client_short: [u8; PUBLIC_KEY_SIZE],
    /// Short nonce.
    pub nonce: [u8; SHORT_NONCE_SIZE],
    /// Message frame boxed short to short.
    pub boxed: Vec<u8>,
}

impl ClientMessagePacket {
    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CLIENT_MESSAGE_BOX_OFFSET + self.boxed.len());
        out.extend_from_slice(TAG_CLIENT_MESSAGE);
        out.extend_from_slice(&self.server_ext);
        out.extend_from_slice(&self.client_ext);
        out.extend_from_slice(&self.client_short);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.boxed);
        out
    }

    /// Decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_min_len(bytes, CLIENT_MESSAGE_BOX_OFFSET + BOX_TAG_SIZE)?;
        expect_tag(bytes, PacketKind::ClientMessage)?;
        let mut f = Fields::after_tag(bytes);
        Ok(Self {
            server_ext: f.take(),
            client_ext: f.take(),
            client_short: f.take(),
            nonce: f.take(),
            boxed: f.rest().to_vec(),
        })
    }
}

/// Server to client Message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessagePacket {
    /// Client extension.
    pub client_ext: Extension,
    /// Server extension.
    pub server_ext: Extension,
    /// Short nonce.
    pub nonce: [u8; SHORT_NONCE_SIZE],
    /// Message frame boxed short to short.
    pub boxed: Vec<u8>,
}

impl ServerMessagePacket {
    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERVER_MESSAGE_BOX_OFFSET + self.boxed.len());
        out.extend_from_slice(TAG_SERVER_MESSAGE);
        out.extend_from_slice(&self.client_ext);
        out.extend_from_slice(&self.server_ext);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.boxed);
        out
    }

    /// Decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        expect_min_len(bytes, SERVER_MESSAGE_BOX_OFFSET + BOX_TAG_SIZE)?;
        expect_tag(bytes, PacketKind::ServerMessage)?;
        let mut f = Fields::after_tag(bytes);
        Ok(Self {
            client_ext: f.take(),
            server_ext: f.take(),
            nonce: f.take(),
            boxed: f.rest().to_vec(),
        })
    }
}

/// Encode a dotted name as length-prefixed labels in a zero-padded 256-byte
/// field. Leading and trailing dots are ignored. Empty interior labels are rejected.
pub fn encode_domain(name: &str) -> Result<[u8; DOMAIN_SIZE], PacketError> {
    let mut out = [0u8; DOMAIN_SIZE];
    let mut pos = 0;
    let trimmed = name.trim_matches('.');
    if trimmed.is_empty() {
        return Ok(out);
    }
    for label in trimmed.split('.') {
        let len = label.len();
        if len == 0 {
            return Err(PacketError::EmptyLabel);
        }
        if len > 63 {
            return Err(PacketError::LabelTooLong(len));
        }
        // Keep room for the terminating zero label.
        if pos + 1 + len >= DOMAIN_SIZE {
            return Err(PacketError::DomainTooLong(name.len()));
        }
        out[pos] = len as u8;
        out[pos + 1..pos + 1 + len].copy_from_slice(label.as_bytes());
        pos += 1 + len;
    }
    Ok(out)
}

/// Decode a domain field, stopping at the first zero-length label.
pub fn decode_domain(field: &[u8; DOMAIN_SIZE]) -> String {
    let mut labels = Vec::new();
    let mut pos = 0;
    while pos < DOMAIN_SIZE {
        let len = usize::from(field[pos]);
        if len == 0 {
            break;
        }
        let end = (pos + 1 + len).min(DOMAIN_SIZE);
        labels.push(String::from_utf8_lossy(&field[pos + 1..end]).into_owned());
        pos += 1 + len;
    }
    labels.join(".")
}
