// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives: CSPRNG, zeroizing secret containers, X25519
//! Diffie-Hellman, XChaCha20-Poly1305 AEAD and HKDF-based key derivation.
pub mod kdf;
mod rng;
mod secret;
pub mod x25519;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
