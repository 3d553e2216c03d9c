//! Per-direction nonce bookkeeping.
//!
//! Outbound packets carry an 8-byte little-endian counter. Inbound counters
//! must strictly increase; ties are replays.

use crate::core::CryptoError;

/// Outbound nonce counter for one connection.
///
/// Shared by every outbound packet of the connection (Hello, Initiate and
/// Messages for a client; Messages for a server), starting at 0.
#[derive(Debug, Clone, Default)]
pub struct NonceCounter {
    next: u64,
    exhausted: bool,
}

impl NonceCounter {
    /// Create a counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next nonce value.
    ///
    /// Fails once the 64-bit space is used up; the session must terminate.
    pub fn next(&mut self) -> Result<u64, CryptoError> {
        if self.exhausted {
            return Err(CryptoError::CounterExhaustion);
        }
        let value = self.next;
        match self.next.checked_add(1) {
            Some(n) => self.next = n,
            None => self.exhausted = true,
        }
        Ok(value)
    }

    /// Take the next nonce value encoded for the wire.
    pub fn next_bytes(&mut self) -> Result<[u8; 8], CryptoError> {
        self.next().map(u64::to_le_bytes)
    }
}

/// Inbound replay guard for one direction.
#[derive(Debug, Clone, Default)]
pub struct ReplayGuard {
    last: Option<u64>,
}

impl ReplayGuard {
    /// Create a guard that has not seen any nonce yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a nonce without recording it.
    pub fn check(&self, nonce: u64) -> Result<(), CryptoError> {
        match self.last {
            Some(last) if nonce <= last => Err(CryptoError::StaleNonce { nonce, last }),
            _ => Ok(()),
        }
    }

    /// Record a nonce whose packet authenticated.
    ///
    /// Callers run [`ReplayGuard::check`] first and only commit after the box
    /// opened, so a forged packet never advances the guard.
    pub fn commit(&mut self, nonce: u64) {
        self.last = Some(nonce);
    }
}

/// Decode a wire nonce.
pub fn decode_short_nonce(bytes: &[u8; 8]) -> u64 {
    u64::from_le_bytes(*bytes)
}
