//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_random_fill() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];

        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);

        // Should not produce all zeros
        assert!(!buf1.iter().all(|&b| b == 0));
        assert!(!buf2.iter().all(|&b| b == 0));

        // Should produce different values each time
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_secure_random_bytes() {
        let bytes1: [u8; 16] = SecureRandom::bytes();
        let bytes2: [u8; 16] = SecureRandom::bytes();

        assert_ne!(bytes1, bytes2);
    }
}
