//! Curve25519 key management
//!
//! Provides key generation and the [`KeyProvider`] implementations used by
//! endpoints. All randomness comes from an explicitly passed RNG so tests can
//! run from a fixed seed.

use std::fmt;

use crate::core::{KeyProvider, LONG_NONCE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
use crypto_box::{PublicKey, SecretKey};
use rand::{CryptoRng, RngCore, SeedableRng, rngs::StdRng};

/// A Curve25519 keypair.
///
/// Used both for long-term identities and for the per-handshake short-term
/// keys. The secret key is zeroized on drop by `crypto_box`.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self::from_secret_bytes(bytes)
    }

    /// Create a keypair from existing secret key material.
    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Get the public key bytes.
    pub fn public_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.public.as_bytes()
    }

    /// Get the secret key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Get the secret key bytes.
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex_prefix(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// A freshly generated long-term identity with random nonces.
///
/// Suitable for clients that do not need a stable identity: a new key is
/// produced for every connection and nonces are drawn at random.
#[derive(Debug)]
pub struct EphemeralKey {
    keypair: Keypair,
    rng: StdRng,
}

impl EphemeralKey {
    /// Generate an ephemeral identity seeded from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let keypair = Keypair::generate(rng);
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self {
            keypair,
            rng: StdRng::from_seed(seed),
        }
    }
}

impl KeyProvider for EphemeralKey {
    fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn nonce(&mut self, _long_term: bool) -> [u8; 16] {
        let mut nonce = [0u8; LONG_NONCE_SIZE];
        self.rng.fill_bytes(&mut nonce);
        nonce
    }
}

/// A stable identity whose nonces are `random(8) || counter(8, LE)`.
///
/// The long-term counter advances in steps of 2^20 so long-term and
/// short-term nonces never collide. The counter lives in memory only.
#[derive(Debug)]
pub struct CountingKey {
    keypair: Keypair,
    counter: u64,
    rng: StdRng,
}

/// Counter step for long-term nonces.
pub const LONG_TERM_COUNTER_STEP: u64 = 1 << 20;

impl CountingKey {
    /// Wrap an existing keypair, starting the counter at `counter`.
    pub fn new(keypair: Keypair, counter: u64, rng: StdRng) -> Self {
        Self {
            keypair,
            counter,
            rng,
        }
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl KeyProvider for CountingKey {
    fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn nonce(&mut self, long_term: bool) -> [u8; 16] {
        let step = if long_term { LONG_TERM_COUNTER_STEP } else { 1 };
        self.counter = self.counter.wrapping_add(step);

        let mut nonce = [0u8; LONG_NONCE_SIZE];
        self.rng.fill_bytes(&mut nonce[..8]);
        nonce[8..].copy_from_slice(&self.counter.to_le_bytes());
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_keypair_generation() {
        let mut rng = rng();
        let kp1 = Keypair::generate(&mut rng);
        let kp2 = Keypair::generate(&mut rng);

        // Keys should be different
        assert_ne!(kp1.public_bytes(), kp2.public_bytes());
        assert_ne!(kp1.secret_bytes(), kp2.secret_bytes());
    }

    #[test]
    fn test_keypair_from_secret_is_deterministic() {
        let kp1 = Keypair::from_secret_bytes([3u8; 32]);
        let kp2 = Keypair::from_secret_bytes([3u8; 32]);
        assert_eq!(kp1.public_bytes(), kp2.public_bytes());
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let a = Keypair::generate(&mut StdRng::seed_from_u64(1));
        let b = Keypair::generate(&mut StdRng::seed_from_u64(1));
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn test_counting_key_nonce_layout() {
        let mut key = CountingKey::new(Keypair::generate(&mut rng()), 0, rng());

        let short = key.nonce(false);
        assert_eq!(&short[8..], &1u64.to_le_bytes());

        let long = key.nonce(true);
        assert_eq!(&long[8..], &(1 + LONG_TERM_COUNTER_STEP).to_le_bytes());
        assert_eq!(key.counter(), 1 + LONG_TERM_COUNTER_STEP);
    }

    #[test]
    fn test_ephemeral_nonces_differ() {
        let mut key = EphemeralKey::generate(&mut rng());
        assert_ne!(key.nonce(true), key.nonce(true));
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = Keypair::from_secret_bytes([9u8; 32]);
        let shown = format!("{kp:?}");
        assert!(shown.contains("public"));
        assert!(!shown.contains("secret"));
    }
}
