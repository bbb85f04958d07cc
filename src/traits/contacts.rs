// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::x25519::{PublicKey, SecretKey};

/// Identity string of a user in the directory.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer we can establish forward-secrecy sessions with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub identity: Identity,
    pub public_key: PublicKey,
}

/// Access to our own long-term identity key material.
///
/// The initial exchange of long-term identity keys is outside of this crate; implementations are
/// expected to hold an already-provisioned key pair.
pub trait IdentityStore {
    fn identity(&self) -> Identity;

    fn secret_key(&self) -> &SecretKey;

    fn public_key(&self) -> PublicKey {
        self.secret_key().public_key()
    }
}

/// Lookup of known peers by identity.
pub trait ContactStore {
    fn contact_for_identity(&self, identity: &Identity) -> Option<Contact>;
}
