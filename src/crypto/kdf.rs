// SPDX-License-Identifier: MIT OR Apache-2.0

//! HKDF-SHA256 key derivation.
//!
//! Two uses: deriving ratchet seeds from one or more Diffie-Hellman shared secrets, and advancing
//! a chain key one step (or deriving the message key from it). Domain separation is done through
//! fixed info labels only; no salt is used.
use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::Secret;

pub const KDF_KEY_SIZE: usize = 32;

/// Derives a 256-bit key from the concatenation of the given input key material parts.
pub fn hkdf_derive(ikm: &[&[u8]], info: &[u8]) -> Secret<KDF_KEY_SIZE> {
    let ikm: Vec<u8> = ikm.concat();
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; KDF_KEY_SIZE];
    hk.expand(info, &mut okm)
        .expect("32 byte output is always a valid hkdf-sha256 length");
    Secret::from_bytes(okm)
}
