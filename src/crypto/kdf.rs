//! Password-to-key derivation.
//!
//! Implements the OpenSSL `EVP_BytesToKey` scheme with MD5 and no
//! salt, which is what the tunnel protocol uses: both ends derive the
//! same key from the shared password, so no key exchange happens on
//! the wire. MD5 is a key-stretching convention here, not an
//! authentication primitive.

use md5::{Digest, Md5};
use zeroize::Zeroizing;

/// A derived symmetric key.
///
/// The backing bytes are zeroized when dropped.
#[derive(Clone)]
pub struct KeyMaterial(Zeroizing<Vec<u8>>);

impl KeyMaterial {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes.
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

/// Derive a key of `key_len` bytes from a password.
///
/// Repeated MD5 blocks: `D1 = MD5(password)`, `Dn = MD5(Dn-1 ||
/// password)`, concatenated until `key_len` bytes are produced.
pub fn derive_key(password: &[u8], key_len: usize) -> KeyMaterial {
    let mut key = Vec::with_capacity(key_len);
    let mut last: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(prev) = &last {
            hasher.update(prev);
        }
        hasher.update(password);
        let digest: [u8; 16] = hasher.finalize().into();

        let take = std::cmp::min(16, key_len - key.len());
        key.extend_from_slice(&digest[..take]);
        last = Some(digest);
    }

    KeyMaterial::from_bytes(key)
}
