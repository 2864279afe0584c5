//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses ChaCha20-Poly1305 with a fresh random 96-bit nonce per record. The
//! cipher is fast in software, constant-time, and widely deployed (TLS 1.3,
//! WireGuard). A sealed record is `nonce || ciphertext || tag`; the caller
//! supplies the record header as associated data so header bytes are bound
//! into the tag without being encrypted.
//!
//! Nonces are random rather than counter-based: peers share one key with no
//! per-peer state, so a counter could not be coordinated across restarts.
//! Collision probability over 96 bits governs external key rotation.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use crate::crypto::{MasterKey, SecureRandom, NONCE_SIZE, RECORD_OVERHEAD};
use crate::error::{Error, Result};

/// ChaCha20-Poly1305 cipher over the shared master key.
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    /// Create a new cipher instance keyed with the master key.
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal a plaintext, returning `nonce || ciphertext || tag`.
    ///
    /// A fresh nonce is drawn from OS entropy for every record.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_SIZE] = SecureRandom::bytes();
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| Error::Crypto)?;

        let mut record = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Open a sealed record.
    ///
    /// Rejects records shorter than [`RECORD_OVERHEAD`] outright; a tag
    /// mismatch (wrong key, tampered bytes, or mismatched AAD) is a
    /// permanent [`Error::Crypto`].
    pub fn open(&self, record: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if record.len() < RECORD_OVERHEAD {
            return Err(Error::packet(format!(
                "record too short: {} bytes (min {RECORD_OVERHEAD})",
                record.len()
            )));
        }

        let (nonce, ciphertext) = record.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::Crypto)
    }
}
