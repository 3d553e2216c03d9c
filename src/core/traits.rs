//! Collaborator traits consumed by the protocol core.

use crate::crypto::Keypair;

/// A long-term identity plus its nonce scheme.
///
/// Long-term boxes (cookies, vouches) need 16-byte nonces that are never
/// reused under the same key. Implementations backed by durable storage keep
/// a counter; ephemeral ones may draw random bytes.
///
/// # Example
///
/// ```ignore
/// struct Fixed(Keypair);
///
/// impl KeyProvider for Fixed {
///     fn keypair(&self) -> &Keypair { &self.0 }
///     fn nonce(&mut self, _long_term: bool) -> [u8; 16] { [0; 16] }
/// }
/// ```
pub trait KeyProvider: Send {
    /// The long-term keypair.
    fn keypair(&self) -> &Keypair;

    /// Produce a fresh 16-byte nonce.
    ///
    /// `long_term` selects the long-term counter (cookie minting) over the
    /// short-term one (vouches).
    fn nonce(&mut self, long_term: bool) -> [u8; 16];
}

impl<T: KeyProvider + ?Sized> KeyProvider for Box<T> {
    fn keypair(&self) -> &Keypair {
        (**self).keypair()
    }

    fn nonce(&mut self, long_term: bool) -> [u8; 16] {
        (**self).nonce(long_term)
    }
}
