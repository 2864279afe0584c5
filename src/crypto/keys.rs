//! The pre-shared master key.
//!
//! Both ends are provisioned with the same 32-byte key; the server can also
//! generate one at startup and print it for the operator. Key material is
//! zeroized on drop and never rendered by `Debug`.

use std::fmt;
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE};
use crate::error::{Error, Result};

/// A 32-byte ChaCha20-Poly1305 key shared between server and clients.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Create a key from exactly [`KEY_SIZE`] bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, rejecting any length other than [`KEY_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::config(format!(
                "invalid key size: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random key from OS entropy.
    pub fn generate() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Load a key file.
    ///
    /// Accepts exactly [`KEY_SIZE`] raw bytes or exactly `2 * KEY_SIZE`
    /// ASCII hex characters. Any other length is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            Error::config(format!("failed to read key file {}: {e}", path.display()))
        })?;
        Self::parse(&data)
    }

    /// Parse key-file contents (raw or hex form).
    pub fn parse(data: &[u8]) -> Result<Self> {
        match data.len() {
            KEY_SIZE => Self::from_slice(data),
            l if l == 2 * KEY_SIZE => {
                let decoded = hex::decode(data)
                    .map_err(|e| Error::config(format!("invalid hex key: {e}")))?;
                Self::from_slice(&decoded)
            }
            other => Err(Error::config(format!(
                "invalid key size: expected {KEY_SIZE} bytes (binary) or {} chars (hex), got {other}",
                2 * KEY_SIZE
            ))),
        }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Hex rendering, for handing a generated key to the operator.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey").field("key", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_exact() {
        assert!(MasterKey::from_slice(&[7u8; KEY_SIZE]).is_ok());
        assert!(MasterKey::from_slice(&[7u8; KEY_SIZE - 1]).is_err());
        assert!(MasterKey::from_slice(&[7u8; KEY_SIZE + 1]).is_err());
        assert!(MasterKey::from_slice(&[]).is_err());
    }

    #[test]
    fn test_parse_raw() {
        let key = MasterKey::parse(&[0xAB; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[0xAB; KEY_SIZE]);
    }

    #[test]
    fn test_parse_hex() {
        let hex_form = "ab".repeat(KEY_SIZE);
        let key = MasterKey::parse(hex_form.as_bytes()).unwrap();
        assert_eq!(key.as_bytes(), &[0xAB; KEY_SIZE]);
    }

    #[test]
    fn test_parse_rejects_other_lengths() {
        // A hex file with a trailing newline is 65 bytes and must be refused.
        let mut hex_form = "ab".repeat(KEY_SIZE);
        hex_form.push('\n');
        assert!(MasterKey::parse(hex_form.as_bytes()).is_err());
        assert!(MasterKey::parse(b"short").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_hex() {
        let not_hex = "zz".repeat(KEY_SIZE);
        assert!(MasterKey::parse(not_hex.as_bytes()).is_err());
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_debug_redacts() {
        let key = MasterKey::from_bytes([0x42; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("42"));
    }

    #[test]
    fn test_hex_round_trip() {
        let key = MasterKey::generate();
        let restored = MasterKey::parse(key.to_hex().as_bytes()).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
    }
}
