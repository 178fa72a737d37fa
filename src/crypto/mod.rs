//! Stream-cipher binding for the tunnel.
//!
//! This module provides:
//! - The cipher method table ([`CipherKind`])
//! - OpenSSL-compatible password-to-key derivation (EVP_BytesToKey)
//! - Per-session encrypt/decrypt contexts with IV-prefix framing
//!
//! The wire format is the classic stream-cipher tunnel: the sender
//! picks a random IV, prepends it to its first segment, and feeds the
//! whole byte stream through one continuous cipher keystream. Both
//! directions use the same password-derived key with independent IVs.
//!
//! Key material is zeroized on drop to prevent memory leakage.

mod kdf;
mod random;
mod stream;

pub use kdf::{derive_key, KeyMaterial};
pub use random::SecureRandom;
pub use stream::{DecryptContext, EncryptContext};

use crate::error::Error;

/// Maximum cipher IV size in bytes across all supported methods.
pub const MAX_IV_SIZE: usize = 16;

/// Supported cipher methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-128 in big-endian counter mode
    Aes128Ctr,
    /// AES-192 in big-endian counter mode
    Aes192Ctr,
    /// AES-256 in big-endian counter mode
    Aes256Ctr,
    /// AES-128 in cipher feedback mode
    Aes128Cfb,
    /// AES-192 in cipher feedback mode
    Aes192Cfb,
    /// AES-256 in cipher feedback mode
    Aes256Cfb,
    /// ChaCha20 with a 96-bit nonce (IETF variant)
    Chacha20Ietf,
}

impl CipherKind {
    /// The method name as written in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Ctr => "aes-128-ctr",
            CipherKind::Aes192Ctr => "aes-192-ctr",
            CipherKind::Aes256Ctr => "aes-256-ctr",
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
            CipherKind::Chacha20Ietf => "chacha20-ietf",
        }
    }

    /// Key size in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Ctr | CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Ctr | CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Ctr | CipherKind::Aes256Cfb => 32,
            CipherKind::Chacha20Ietf => 32,
        }
    }

    /// IV size in bytes.
    pub fn iv_len(&self) -> usize {
        match self {
            CipherKind::Chacha20Ietf => 12,
            _ => 16,
        }
    }
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::Aes256Cfb
    }
}

impl std::str::FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-128-ctr" => Ok(CipherKind::Aes128Ctr),
            "aes-192-ctr" => Ok(CipherKind::Aes192Ctr),
            "aes-256-ctr" => Ok(CipherKind::Aes256Ctr),
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            "chacha20-ietf" => Ok(CipherKind::Chacha20Ietf),
            _ => Err(Error::crypto(format!("unknown cipher method: {s}"))),
        }
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_roundtrip() {
        for name in [
            "aes-128-ctr",
            "aes-192-ctr",
            "aes-256-ctr",
            "aes-128-cfb",
            "aes-192-cfb",
            "aes-256-cfb",
            "chacha20-ietf",
        ] {
            let kind: CipherKind = name.parse().unwrap();
            assert_eq!(kind.name(), name);
        }
    }

    #[test]
    fn test_unknown_method() {
        assert!("rc4-md5".parse::<CipherKind>().is_err());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(CipherKind::Aes128Ctr.key_len(), 16);
        assert_eq!(CipherKind::Aes256Cfb.key_len(), 32);
        assert_eq!(CipherKind::Aes256Cfb.iv_len(), 16);
        assert_eq!(CipherKind::Chacha20Ietf.iv_len(), 12);
        for name in ["aes-128-ctr", "aes-256-cfb", "chacha20-ietf"] {
            let kind: CipherKind = name.parse().unwrap();
            assert!(kind.iv_len() <= MAX_IV_SIZE);
        }
    }
}
