// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated encryption.
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::crypto::Secret;

pub const XAEAD_KEY_SIZE: usize = 32;

pub const XAEAD_NONCE_SIZE: usize = 24;

pub type XAeadKey = Secret<XAEAD_KEY_SIZE>;

pub type XAeadNonce = [u8; XAEAD_NONCE_SIZE];

/// All-zero nonce.
///
/// Only safe when the key is guaranteed to encrypt exactly one message, which is the case for
/// ratchet message keys: each is derived once, used once and then irrecoverably replaced.
pub const ZERO_NONCE: XAeadNonce = [0; XAEAD_NONCE_SIZE];

/// Encrypts and authenticates a plaintext.
pub fn xaead_seal(
    key: &XAeadKey,
    nonce: XAeadNonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| XAeadError::EncryptFailed)?;
    Ok(ciphertext)
}

/// Decrypts a ciphertext, failing when the authentication tag does not verify.
pub fn xaead_open(
    key: &XAeadKey,
    nonce: XAeadNonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| XAeadError::DecryptFailed)?;
    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum XAeadError {
    #[error("could not encrypt payload with xchacha20-poly1305")]
    EncryptFailed,

    #[error("could not authenticate and decrypt payload with xchacha20-poly1305")]
    DecryptFailed,
}
