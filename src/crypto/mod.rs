//! Record encryption
//!
//! The symmetric key is derived by hashing the UTF-8 bytes of the
//! pre-shared secret with MD5, giving the 16 bytes AES-128-GCM wants.
//! MD5 is weak as a KDF but it is what every deployed peer derives its
//! key with; replacing it means a wire-format version bump.
//!
//! Nonces are owned by the record layer: `seal` and `open` take the
//! 12-byte nonce explicitly so the framer can place it after the
//! ciphertext on the wire.

use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit},
};

/// Nonce length for AES-128-GCM, in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-128-GCM sealer/opener with an MD5-derived key.
///
/// Cheap to clone; reader and writer tasks each hold their own copy so
/// no cipher state is shared across tasks.
#[derive(Clone)]
pub struct Cipher {
    cipher: Aes128Gcm,
}

impl Cipher {
    /// Derives the AES key from the pre-shared secret and builds the cipher.
    pub fn new(key: &str) -> Self {
        let digest = md5::compute(key.as_bytes());
        Self {
            cipher: Aes128Gcm::new((&digest.0).into()),
        }
    }

    /// Encrypts `plain` under `nonce`.
    ///
    /// # Returns
    /// Ciphertext with the 16-byte authentication tag appended.
    pub fn seal(&self, plain: &[u8], nonce: &[u8; NONCE_LEN]) -> crate::Result<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plain)
            .map_err(|e| format!("AES-128-GCM encryption failed: {}", e).into())
    }

    /// Decrypts and authenticates `sealed` (ciphertext plus tag) under `nonce`.
    ///
    /// Fails when the tag does not verify, which in practice means the
    /// peer derived its key from a different secret.
    pub fn open(&self, sealed: &[u8], nonce: &[u8; NONCE_LEN]) -> crate::Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| format!("AES-128-GCM decryption failed: {}", e).into())
    }
}

/// Builds the cipher for a configured secret.
///
/// An empty secret disables encryption entirely; records are then
/// emitted and accepted in the clear.
pub fn make_cipher(key: &str) -> Option<Cipher> {
    if key.is_empty() {
        return None;
    }
    Some(Cipher::new(key))
}
