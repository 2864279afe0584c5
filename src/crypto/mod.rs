//! Cryptographic primitives for the tunnel record layer.
//!
//! This module provides:
//! - The pre-shared 32-byte master key both ends are provisioned with
//! - ChaCha20-Poly1305 AEAD sealing of tunnel records
//! - Secure random number generation
//!
//! There is no key agreement: the master key is supplied out of band and
//! stays fixed for the process lifetime. Secret material is zeroized on
//! drop to prevent memory leakage.

mod aead;
mod keys;
mod random;

pub use aead::PacketCipher;
pub use keys::MasterKey;
pub use random::SecureRandom;

/// Size of the symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed record adds on top of its plaintext (nonce + tag)
pub const RECORD_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layer_end_to_end() {
        // Both ends derive their cipher from the same provisioned key.
        let key = MasterKey::generate();
        let sender = PacketCipher::new(&key);
        let receiver = PacketCipher::new(&key);

        let plaintext = b"one inner IP packet";
        let aad = [0x01, 0, 0, 0, 7, 0];

        let record = sender.seal(plaintext, &aad).unwrap();
        assert_eq!(record.len(), plaintext.len() + RECORD_OVERHEAD);

        let opened = receiver.open(&record, &aad).unwrap();
        assert_eq!(opened, plaintext);
    }
}
