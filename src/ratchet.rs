// SPDX-License-Identifier: MIT OR Apache-2.0

//! KDF ratchet deriving a monotonically advancing sequence of one-time message keys.
//!
//! Each turn replaces the chain key with a one-way derived successor and discards the previous
//! one, so keys for already-processed messages cannot be recomputed from current state. The same
//! ratchet construction is used for 2DH and 4DH chains; the two differ only in the seed material
//! fed in by the session.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Secret;
use crate::crypto::kdf::{KDF_KEY_SIZE, hkdf_derive};

pub const CHAIN_KEY_SIZE: usize = KDF_KEY_SIZE;

pub const MESSAGE_KEY_SIZE: usize = KDF_KEY_SIZE;

const CHAIN_INFO: &[u8] = b"pfs-kdf-chain";

const MESSAGE_INFO: &[u8] = b"pfs-kdf-message";

/// One-way chain of encryption keys.
///
/// The counter names the key that will encrypt or decrypt the next message; it starts at 1 and
/// advances by exactly one per turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfRatchet {
    chain_key: Secret<CHAIN_KEY_SIZE>,
    counter: u64,
}

impl KdfRatchet {
    pub fn new(chain_key: Secret<CHAIN_KEY_SIZE>) -> Self {
        Self {
            chain_key,
            counter: 1,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Returns the message key for the current counter value.
    ///
    /// The key is derived from the chain key with a separate label, so handing it out does not
    /// reveal the chain itself.
    pub fn current_encryption_key(&self) -> Secret<MESSAGE_KEY_SIZE> {
        hkdf_derive(&[self.chain_key.as_bytes()], MESSAGE_INFO)
    }

    /// Advances the ratchet one step, irrecoverably replacing the chain key.
    pub fn turn(&mut self) {
        self.chain_key = hkdf_derive(&[self.chain_key.as_bytes()], CHAIN_INFO);
        self.counter += 1;
    }

    /// Turns the ratchet until the counter matches `target`, returning the number of steps taken.
    ///
    /// A target below the current counter means the key for that message is already gone; this is
    /// a replay or a reordering beyond what the ratchet can tolerate and fails without mutating
    /// any state.
    pub fn turn_until(&mut self, target: u64) -> Result<u64, RatchetError> {
        if target < self.counter {
            return Err(RatchetError::CannotRewind {
                counter: self.counter,
                target,
            });
        }
        let steps = target - self.counter;
        while self.counter < target {
            self.turn();
        }
        Ok(steps)
    }
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("ratchet at counter {counter} cannot rewind to {target}, key material is gone")]
    CannotRewind { counter: u64, target: u64 },
}
