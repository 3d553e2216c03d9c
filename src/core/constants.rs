//! Protocol constants for CurveCP.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed; changing
//! them breaks interoperability with every other implementation.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Curve25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Curve25519 secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// Poly1305 authenticator prepended to every box.
pub const BOX_TAG_SIZE: usize = 16;

/// XSalsa20 nonce size.
pub const BOX_NONCE_SIZE: usize = 24;

/// Size of a short (counter) nonce carried on the wire.
pub const SHORT_NONCE_SIZE: usize = 8;

/// Size of a long nonce carried on the wire (cookie and vouch nonces).
pub const LONG_NONCE_SIZE: usize = 16;

/// Size of the opaque client and server extensions.
pub const EXTENSION_SIZE: usize = 16;

// =============================================================================
// PACKET TAGS
// =============================================================================

/// Client Hello packet.
pub const TAG_HELLO: &[u8; 8] = b"QvnQ5XlH";

/// Server Cookie packet.
pub const TAG_COOKIE: &[u8; 8] = b"RL3aNMXK";

/// Client Initiate packet.
pub const TAG_INITIATE: &[u8; 8] = b"QvnQ5XlI";

/// Client Message packet.
pub const TAG_CLIENT_MESSAGE: &[u8; 8] = b"QvnQ5XlM";

/// Server Message packet.
pub const TAG_SERVER_MESSAGE: &[u8; 8] = b"RL3aNMXM";

// =============================================================================
// PACKET SIZES
// =============================================================================

/// Packet tag size.
pub const TAG_SIZE: usize = 8;

/// Encoded domain name field.
pub const DOMAIN_SIZE: usize = 256;

/// Opaque cookie: nonce (16) + secretbox over two keys (64 + 16).
pub const COOKIE_SIZE: usize = LONG_NONCE_SIZE + 2 * PUBLIC_KEY_SIZE + BOX_TAG_SIZE;

/// Zero padding inside Hello that keeps it at least as large as the Cookie.
pub const HELLO_PADDING_SIZE: usize = 64;

/// Hello box: 64 zero bytes sealed.
pub const HELLO_BOX_SIZE: usize = HELLO_PADDING_SIZE + BOX_TAG_SIZE;

/// Complete Hello packet (224 bytes).
pub const HELLO_PACKET_SIZE: usize = TAG_SIZE
    + 2 * EXTENSION_SIZE
    + PUBLIC_KEY_SIZE
    + HELLO_PADDING_SIZE
    + SHORT_NONCE_SIZE
    + HELLO_BOX_SIZE;

/// Cookie box: server short-term key plus cookie, sealed.
pub const COOKIE_BOX_SIZE: usize = PUBLIC_KEY_SIZE + COOKIE_SIZE + BOX_TAG_SIZE;

/// Complete Cookie packet (200 bytes).
pub const COOKIE_PACKET_SIZE: usize =
    TAG_SIZE + 2 * EXTENSION_SIZE + LONG_NONCE_SIZE + COOKIE_BOX_SIZE;

/// Offset of the Initiate box (after tag, extensions, key, cookie and nonce).
pub const INITIATE_BOX_OFFSET: usize =
    TAG_SIZE + 2 * EXTENSION_SIZE + PUBLIC_KEY_SIZE + COOKIE_SIZE + SHORT_NONCE_SIZE;

/// Vouch box: the client short-term key sealed under the long-term keys.
pub const VOUCH_SIZE: usize = PUBLIC_KEY_SIZE + BOX_TAG_SIZE;

/// Fixed prefix of the Initiate plaintext before the embedded message frame.
pub const INITIATE_INNER_PREFIX_SIZE: usize =
    PUBLIC_KEY_SIZE + LONG_NONCE_SIZE + VOUCH_SIZE + DOMAIN_SIZE;

/// Offset of the box in a client Message packet.
pub const CLIENT_MESSAGE_BOX_OFFSET: usize =
    TAG_SIZE + 2 * EXTENSION_SIZE + PUBLIC_KEY_SIZE + SHORT_NONCE_SIZE;

/// Offset of the box in a server Message packet.
pub const SERVER_MESSAGE_BOX_OFFSET: usize = TAG_SIZE + 2 * EXTENSION_SIZE + SHORT_NONCE_SIZE;

/// Smallest datagram the server dispatcher considers.
pub const MIN_CLIENT_DATAGRAM: usize = 80;

/// Largest datagram the server dispatcher considers.
pub const MAX_CLIENT_DATAGRAM: usize = 1184;

/// Receive buffer large enough for any CurveCP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

// =============================================================================
// MESSAGE FRAME
// =============================================================================

/// Maximum data bytes carried by one message frame.
pub const MAX_MESSAGE_DATA: usize = 1024;

/// Data block buckets; the data block is padded to the smallest fitting one.
pub const MESSAGE_DATA_BUCKETS: [usize; 4] = [192, 320, 576, 1024];

/// Maximum acknowledgment ranges carried by one frame.
pub const MAX_ACK_RANGES: usize = 6;

// =============================================================================
// TIMING
// =============================================================================

/// Handshake retry schedule, as gaps between consecutive sends.
///
/// The last entry is the gap between the final resend and expiry.
pub const HANDSHAKE_RETRY_SCHEDULE: [Duration; 7] = [
    Duration::from_secs(1),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(13),
];

/// How long the scheduler sleeps when it has nothing to send.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of cookie replies remembered for duplicate Hellos.
pub const DEFAULT_COOKIE_CACHE_SIZE: usize = 1024;
