// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 Diffie-Hellman key types.
//!
//! Long-term identity keys and per-session ephemeral keys are both plain X25519 key pairs; 2DH
//! and 4DH session modes differ only in how many of these shared secrets are fed into the ratchet
//! seed derivation.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Rng, RngError, Secret};

pub const X25519_KEY_SIZE: usize = 32;

/// X25519 secret key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<X25519_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    /// Generates a new random secret key.
    pub fn generate(rng: &Rng) -> Result<Self, X25519Error> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    /// Derives the public counterpart of this secret key.
    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(*self.0.as_bytes());
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

/// X25519 public key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; X25519_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Computes the X25519 shared secret between our secret key and their public key.
///
/// The all-zero output (contributory misbehavior, low-order public key) is rejected.
pub fn x25519(
    secret: &SecretKey,
    public: &PublicKey,
) -> Result<Secret<X25519_KEY_SIZE>, X25519Error> {
    let secret = x25519_dalek::StaticSecret::from(*secret.0.as_bytes());
    let public = x25519_dalek::PublicKey::from(*public.as_bytes());
    let shared = secret.diffie_hellman(&public);
    if !shared.was_contributory() {
        return Err(X25519Error::NonContributory);
    }
    Ok(Secret::from_bytes(shared.to_bytes()))
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("public key is of low order, shared secret would be all-zero")]
    NonContributory,
}
