//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source. Used for per-session cipher IVs.

use rand::rngs::OsRng;
use rand::RngCore;

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
}
