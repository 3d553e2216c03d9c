//! Error types for the CurveCP protocol.
//!
//! Codec and crypto errors never reach the peer: the connection layer logs
//! them and drops the offending datagram without responding.

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Box encryption failed.
    #[error("box encryption failed")]
    EncryptionFailed,

    /// Box authentication or decryption failed.
    #[error("box decryption failed (invalid authenticator or corrupted)")]
    DecryptionFailed,

    /// Inbound nonce was not greater than the last accepted one.
    #[error("stale nonce {nonce} (last accepted {last})")]
    StaleNonce {
        /// Nonce carried by the packet.
        nonce: u64,
        /// Last nonce accepted in this direction.
        last: u64,
    },

    /// Outbound nonce counter exhausted - session must terminate.
    #[error("nonce counter exhausted - session must terminate")]
    CounterExhaustion,

    /// Decrypted key material was not a valid key.
    #[error("invalid key material")]
    InvalidKey,
}

/// Errors parsing or building wire packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Packet has the wrong length for its kind.
    #[error("wrong packet length: expected {expected}, got {actual}")]
    WrongLength {
        /// Expected (or minimum) length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Tag is not one of the known packet tags.
    #[error("unknown packet tag")]
    UnknownTag,

    /// Extensions do not match the connection.
    #[error("extension mismatch")]
    ExtensionMismatch,

    /// Sender short-term key does not match the connection.
    #[error("short-term key mismatch")]
    KeyMismatch,

    /// Valid packet kind, but not one the receiver accepts in its state.
    #[error("unexpected {0} packet")]
    Unexpected(&'static str),

    /// Domain name does not fit in the 256-byte field.
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    /// A single domain label exceeds 63 bytes.
    #[error("domain label too long: {0} bytes")]
    LabelTooLong(usize),

    /// A domain name has an empty interior label, as in `a..b`.
    #[error("empty domain label")]
    EmptyLabel,
}

/// Errors packing or unpacking message frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Data exceeds a single frame.
    #[error("data is {len} bytes when the limit is {limit}")]
    DataTooLong {
        /// Data length.
        len: usize,
        /// Maximum allowed.
        limit: usize,
    },

    /// Frame is shorter than its header or declared data length.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Acknowledgment ranges were not sorted and disjoint.
    #[error("acknowledgment ranges must be sorted and disjoint")]
    UnsortedRanges,

    /// Range accumulation exceeded the 64-bit offset space.
    #[error("acknowledgment range overflows the stream offset space")]
    RangeOverflow,
}

/// Errors from the reliable stream engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Writes were already closing or closed.
    #[error("connection closing: attempted a write after closing writes")]
    ConnectionClosing,

    /// The connection has completed both directions.
    #[error("connection done")]
    ConnectionDone,
}

/// Errors establishing a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No valid response arrived within the retry schedule.
    #[error("handshake timed out")]
    Timeout,

    /// The stream is not available until the handshake completes.
    #[error("connection not established")]
    NotEstablished,
}

/// Top-level CurveCP errors.
#[derive(Debug, Error)]
pub enum CurveCpError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Message frame error.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Handshake error.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// The peer resolved the connection with failure.
    #[error("connection failed by peer")]
    ConnectionFailed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CurveCpError {
    /// Check if this error should result in a silent drop of the datagram.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            CurveCpError::Crypto(
                CryptoError::DecryptionFailed
                    | CryptoError::StaleNonce { .. }
                    | CryptoError::InvalidKey
            ) | CurveCpError::Packet(_)
                | CurveCpError::Message(_)
        )
    }
}

/// Result type for CurveCP operations.
pub type CurveCpResult<T> = Result<T, CurveCpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_drop_errors() {
        assert!(CurveCpError::from(CryptoError::DecryptionFailed).is_silent_drop());
        assert!(CurveCpError::from(CryptoError::StaleNonce { nonce: 1, last: 2 }).is_silent_drop());
        assert!(CurveCpError::from(PacketError::UnknownTag).is_silent_drop());
        assert!(CurveCpError::from(MessageError::RangeOverflow).is_silent_drop());

        assert!(!CurveCpError::from(HandshakeError::Timeout).is_silent_drop());
        assert!(!CurveCpError::from(StreamError::ConnectionClosing).is_silent_drop());
    }

    #[test]
    fn test_message_error_display() {
        let err = MessageError::DataTooLong { len: 1025, limit: 1024 };
        assert_eq!(err.to_string(), "data is 1025 bytes when the limit is 1024");
    }
}
