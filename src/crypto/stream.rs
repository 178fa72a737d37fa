//! Per-session stream-cipher contexts.
//!
//! Each session direction owns one context. The encrypt context
//! generates a random IV on first use and prepends it to its first
//! output segment; the decrypt context consumes the peer's IV from the
//! head of the incoming stream before producing plaintext. After IV
//! setup, both are a single continuous keystream applied across every
//! segment, so the contexts are stateful and must never be shared.
//!
//! Both transforms return a fresh owned buffer that the caller adopts;
//! the input buffer is never modified.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::ChaCha20;
use cipher::{KeyIvInit, StreamCipher};

use crate::crypto::{CipherKind, KeyMaterial, SecureRandom, MAX_IV_SIZE};
use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// One direction's keystream state.
///
/// CTR and ChaCha20 use the same transform for both directions; CFB
/// needs distinct encrypt/decrypt variants.
enum Keystream {
    Aes128Ctr(Box<Aes128Ctr>),
    Aes192Ctr(Box<Aes192Ctr>),
    Aes256Ctr(Box<Aes256Ctr>),
    Aes128CfbEnc(Box<BufEncryptor<Aes128>>),
    Aes192CfbEnc(Box<BufEncryptor<Aes192>>),
    Aes256CfbEnc(Box<BufEncryptor<Aes256>>),
    Aes128CfbDec(Box<BufDecryptor<Aes128>>),
    Aes192CfbDec(Box<BufDecryptor<Aes192>>),
    Aes256CfbDec(Box<BufDecryptor<Aes256>>),
    Chacha20(Box<ChaCha20>),
}

impl Keystream {
    fn encryptor(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad_key = |_| Error::crypto("invalid key or IV length");
        Ok(match kind {
            CipherKind::Aes128Ctr => {
                Keystream::Aes128Ctr(Box::new(Aes128Ctr::new_from_slices(key, iv).map_err(bad_key)?))
            }
            CipherKind::Aes192Ctr => {
                Keystream::Aes192Ctr(Box::new(Aes192Ctr::new_from_slices(key, iv).map_err(bad_key)?))
            }
            CipherKind::Aes256Ctr => {
                Keystream::Aes256Ctr(Box::new(Aes256Ctr::new_from_slices(key, iv).map_err(bad_key)?))
            }
            CipherKind::Aes128Cfb => Keystream::Aes128CfbEnc(Box::new(
                BufEncryptor::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            CipherKind::Aes192Cfb => Keystream::Aes192CfbEnc(Box::new(
                BufEncryptor::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            CipherKind::Aes256Cfb => Keystream::Aes256CfbEnc(Box::new(
                BufEncryptor::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            CipherKind::Chacha20Ietf => {
                Keystream::Chacha20(Box::new(ChaCha20::new_from_slices(key, iv).map_err(bad_key)?))
            }
        })
    }

    fn decryptor(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad_key = |_| Error::crypto("invalid key or IV length");
        Ok(match kind {
            CipherKind::Aes128Cfb => Keystream::Aes128CfbDec(Box::new(
                BufDecryptor::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            CipherKind::Aes192Cfb => Keystream::Aes192CfbDec(Box::new(
                BufDecryptor::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            CipherKind::Aes256Cfb => Keystream::Aes256CfbDec(Box::new(
                BufDecryptor::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            // Symmetric keystreams: same state as the encrypt side.
            other => Self::encryptor(other, key, iv)?,
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Keystream::Aes128Ctr(c) => c.apply_keystream(data),
            Keystream::Aes192Ctr(c) => c.apply_keystream(data),
            Keystream::Aes256Ctr(c) => c.apply_keystream(data),
            Keystream::Aes128CfbEnc(c) => c.encrypt(data),
            Keystream::Aes192CfbEnc(c) => c.encrypt(data),
            Keystream::Aes256CfbEnc(c) => c.encrypt(data),
            Keystream::Aes128CfbDec(c) => c.decrypt(data),
            Keystream::Aes192CfbDec(c) => c.decrypt(data),
            Keystream::Aes256CfbDec(c) => c.decrypt(data),
            Keystream::Chacha20(c) => c.apply_keystream(data),
        }
    }
}

/// Upstream-bound cipher context.
pub struct EncryptContext {
    kind: CipherKind,
    key: KeyMaterial,
    state: Option<Keystream>,
}

impl EncryptContext {
    /// Create a context for one session's upstream-bound direction.
    pub fn new(kind: CipherKind, key: &KeyMaterial) -> Self {
        Self {
            kind,
            key: key.clone(),
            state: None,
        }
    }

    /// Encrypt one segment, returning an owned buffer.
    ///
    /// The first call prepends the freshly generated IV, so the output
    /// may be longer than the input.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            Some(keystream) => {
                let mut out = plaintext.to_vec();
                keystream.apply(&mut out);
                Ok(out)
            }
            None => {
                let iv_len = self.kind.iv_len();
                let mut iv = [0u8; MAX_IV_SIZE];
                SecureRandom::fill(&mut iv[..iv_len]);

                let mut keystream =
                    Keystream::encryptor(self.kind, self.key.as_bytes(), &iv[..iv_len])?;

                let mut out = Vec::with_capacity(iv_len + plaintext.len());
                out.extend_from_slice(&iv[..iv_len]);
                out.extend_from_slice(plaintext);
                keystream.apply(&mut out[iv_len..]);

                self.state = Some(keystream);
                Ok(out)
            }
        }
    }
}

/// Upstream-received cipher context.
pub struct DecryptContext {
    kind: CipherKind,
    key: KeyMaterial,
    state: Option<Keystream>,
    iv_buf: Vec<u8>,
}

impl DecryptContext {
    /// Create a context for one session's upstream-received direction.
    pub fn new(kind: CipherKind, key: &KeyMaterial) -> Self {
        Self {
            kind,
            key: key.clone(),
            state: None,
            iv_buf: Vec::with_capacity(kind.iv_len()),
        }
    }

    /// Decrypt one segment, returning an owned buffer.
    ///
    /// Until the peer's IV has fully arrived the result is empty; the
    /// IV may span segment boundaries.
    pub fn decrypt(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut data = input;

        if self.state.is_none() {
            let need = self.kind.iv_len() - self.iv_buf.len();
            let take = std::cmp::min(need, data.len());
            self.iv_buf.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.iv_buf.len() < self.kind.iv_len() {
                return Ok(Vec::new());
            }
            self.state = Some(Keystream::decryptor(
                self.kind,
                self.key.as_bytes(),
                &self.iv_buf,
            )?);
        }

        let mut out = data.to_vec();
        if let Some(keystream) = &mut self.state {
            keystream.apply(&mut out);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    fn contexts(kind: CipherKind) -> (EncryptContext, DecryptContext) {
        let key = derive_key(b"barfoo!", kind.key_len());
        (
            EncryptContext::new(kind, &key),
            DecryptContext::new(kind, &key),
        )
    }

    #[test]
    fn test_first_segment_carries_iv() {
        let (mut enc, _) = contexts(CipherKind::Aes256Cfb);

        let first = enc.encrypt(b"hello").unwrap();
        assert_eq!(first.len(), 16 + 5);

        let second = enc.encrypt(b"world").unwrap();
        assert_eq!(second.len(), 5);
    }

    #[test]
    fn test_roundtrip_across_fragmentation() {
        for kind in [
            CipherKind::Aes128Ctr,
            CipherKind::Aes256Cfb,
            CipherKind::Chacha20Ietf,
        ] {
            let (mut enc, mut dec) = contexts(kind);

            let mut wire = Vec::new();
            wire.extend(enc.encrypt(b"the quick brown fox ").unwrap());
            wire.extend(enc.encrypt(b"jumps over ").unwrap());
            wire.extend(enc.encrypt(b"the lazy dog").unwrap());

            // Feed the wire bytes back in awkward fragment sizes.
            let mut plain = Vec::new();
            for chunk in wire.chunks(7) {
                plain.extend(dec.decrypt(chunk).unwrap());
            }

            assert_eq!(plain, b"the quick brown fox jumps over the lazy dog");
        }
    }

    #[test]
    fn test_decrypt_waits_for_full_iv() {
        let (mut enc, mut dec) = contexts(CipherKind::Aes256Ctr);
        let wire = enc.encrypt(b"payload").unwrap();

        // One byte at a time through the IV: no output until byte 16.
        for byte in &wire[..16] {
            assert!(dec.decrypt(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        assert_eq!(dec.decrypt(&wire[16..]).unwrap(), b"payload");
    }

    #[test]
    fn test_sessions_get_distinct_ivs() {
        let key = derive_key(b"same password", 32);
        let a = EncryptContext::new(CipherKind::Aes256Cfb, &key)
            .encrypt(b"identical")
            .unwrap();
        let b = EncryptContext::new(CipherKind::Aes256Cfb, &key)
            .encrypt(b"identical")
            .unwrap();

        assert_ne!(a[..16], b[..16]);
        assert_ne!(a[16..], b[16..]);
    }

    #[test]
    fn test_wrong_key_garbles() {
        let (mut enc, _) = contexts(CipherKind::Aes256Cfb);
        let wrong = derive_key(b"not the password", 32);
        let mut dec = DecryptContext::new(CipherKind::Aes256Cfb, &wrong);

        let wire = enc.encrypt(b"plaintext").unwrap();
        let out = dec.decrypt(&wire).unwrap();
        assert_ne!(out, b"plaintext");
    }
}
