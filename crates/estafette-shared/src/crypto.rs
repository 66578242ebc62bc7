use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{BOX_OVERHEAD, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt a buffer in place with a fixed per-content-class nonce.
///
/// Appends the 16-byte Poly1305 tag to `buf`; callers that pre-reserve
/// [`BOX_OVERHEAD`] avoid a reallocation. Nonce reuse is safe here because
/// every message carries its own freshly generated key.
pub fn encrypt_in_place(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    buf: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt_in_place(XNonce::from_slice(nonce), b"", buf)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Encrypt a buffer with a fixed nonce, returning ciphertext || tag.
pub fn encrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt a ciphertext produced by [`encrypt_with_nonce`] / [`encrypt_in_place`].
pub fn decrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < BOX_OVERHEAD {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), data)
        .map_err(|_| CryptoError::DecryptionFailed)
}
