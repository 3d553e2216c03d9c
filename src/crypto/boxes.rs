//! Public-key boxes and the server cookie secretbox
//!
//! Every box in CurveCP is XSalsa20-Poly1305 with a 24-byte nonce built as
//! `prefix || suffix`. The prefix names the packet and direction, so a
//! ciphertext produced for one context never opens in another.

use crypto_box::{
    PublicKey, SalsaBox, SecretKey,
    aead::{Aead, generic_array::GenericArray},
};
use crypto_secretbox::{KeyInit, XSalsa20Poly1305};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::core::{BOX_NONCE_SIZE, CryptoError};

/// Domain-separation prefixes for every encryption context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoncePrefix {
    /// Client Hello box (short-term client, long-term server).
    ClientHello,
    /// Server Cookie box (long-term server, short-term client).
    Cookie,
    /// Client Initiate box (short-term to short-term).
    ClientInitiate,
    /// Vouch box (long-term to long-term).
    Vouch,
    /// Client Message box.
    ClientMessage,
    /// Server Message box.
    ServerMessage,
    /// Cookie secretbox under the server-local key.
    CookieSecret,
}

impl NoncePrefix {
    /// The literal prefix bytes.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            NoncePrefix::ClientHello => b"CurveCP-client-H",
            NoncePrefix::Cookie => b"CurveCPK",
            NoncePrefix::ClientInitiate => b"CurveCP-client-I",
            NoncePrefix::Vouch => b"CurveCPV",
            NoncePrefix::ClientMessage => b"CurveCP-client-M",
            NoncePrefix::ServerMessage => b"CurveCP-server-M",
            NoncePrefix::CookieSecret => b"cccccccc",
        }
    }

    /// Length of the suffix carried on the wire (8 or 16 bytes).
    pub fn suffix_len(self) -> usize {
        BOX_NONCE_SIZE - self.as_bytes().len()
    }
}

/// Construct a 24-byte box nonce.
///
/// Layout:
/// ```text
/// [ prefix (16 or 8) | suffix (8 or 16) ]
/// ```
pub fn construct_nonce(
    prefix: NoncePrefix,
    suffix: &[u8],
) -> Result<[u8; BOX_NONCE_SIZE], CryptoError> {
    let head = prefix.as_bytes();
    if suffix.len() != prefix.suffix_len() {
        return Err(CryptoError::EncryptionFailed);
    }
    let mut nonce = [0u8; BOX_NONCE_SIZE];
    nonce[..head.len()].copy_from_slice(head);
    nonce[head.len()..].copy_from_slice(suffix);
    Ok(nonce)
}

/// A precomputed box between one of our secret keys and a peer public key.
pub struct PeerBox {
    inner: SalsaBox,
}

impl PeerBox {
    /// Precompute the shared key.
    pub fn new(their_public: &PublicKey, our_secret: &SecretKey) -> Self {
        Self {
            inner: SalsaBox::new(their_public, our_secret),
        }
    }

    /// Seal `plaintext` under `prefix || suffix`.
    pub fn seal(
        &self,
        prefix: NoncePrefix,
        suffix: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = construct_nonce(prefix, suffix)?;
        self.inner
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Authenticate and open `ciphertext` under `prefix || suffix`.
    pub fn open(
        &self,
        prefix: NoncePrefix,
        suffix: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = construct_nonce(prefix, suffix).map_err(|_| CryptoError::DecryptionFailed)?;
        self.inner
            .decrypt(GenericArray::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// The server-local symmetric key that seals cookies.
///
/// Generated once per dispatcher and never persisted or revealed, so cookies
/// are self-validating without per-client state and do not survive a restart.
pub struct CookieKey {
    cipher: XSalsa20Poly1305,
}

impl CookieKey {
    /// Generate a fresh cookie key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&key));
        key.zeroize();
        Self { cipher }
    }

    /// Seal cookie contents under `cccccccc || nonce`.
    pub fn seal(&self, nonce: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = construct_nonce(NoncePrefix::CookieSecret, nonce)?;
        self.cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open cookie contents.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = construct_nonce(NoncePrefix::CookieSecret, nonce)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.cipher
            .decrypt(GenericArray::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
