// SPDX-License-Identifier: MIT OR Apache-2.0

//! Forward-secrecy session between us and one peer.
//!
//! A session starts in 2DH mode with a KDF ratchet seeded from a single Diffie-Hellman
//! computation between the initiator's fresh ephemeral key and the responder's long-term identity
//! key. Once the responder's Accept (carrying their own ephemeral key) has been processed, both
//! sides derive the 4DH ratchets from four Diffie-Hellman computations, one per combination of
//! ephemeral and identity keys. 4DH is the final mode: once a 4DH message from the peer has been
//! seen, the 2DH receive chain is discarded for good.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error, x25519};
use crate::crypto::kdf::hkdf_derive;
use crate::crypto::{Rng, RngError};
use crate::ratchet::KdfRatchet;
use crate::traits::{Contact, Identity};
use crate::version::{Version, VersionError, VersionRange};

pub const SESSION_ID_SIZE: usize = 16;

const INFO_2DH: &[u8] = b"pfs-2dh";

const INFO_4DH_INITIATOR: &[u8] = b"pfs-4dh-initiator";

const INFO_4DH_RESPONDER: &[u8] = b"pfs-4dh-responder";

/// Random 16-byte session identifier.
///
/// Among the sessions open with one peer the lowest id is the "best" one, preferred for outgoing
/// messages and kept when pruning after 4DH is confirmed.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(#[serde(with = "serde_bytes")] [u8; SESSION_ID_SIZE]);

impl SessionId {
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

/// Which DH chain a message was encrypted under.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhType {
    TwoDh,
    FourDh,
}

impl fmt::Display for DhType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhType::TwoDh => write!(f, "2DH"),
            DhType::FourDh => write!(f, "4DH"),
        }
    }
}

/// Lifecycle state, derived from which ratchet chains are present.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// We sent an Init and can send 2DH messages; nothing can be received yet.
    InitiatorHandshake,

    /// We answered an Init: 4DH is derived on our side but the peer may still have 2DH messages
    /// in flight from before our Accept reached them.
    ResponderHandshake,

    /// Both directions run on 4DH chains exclusively.
    Established,
}

/// Cryptographic state of one session with a peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhSession {
    id: SessionId,
    my_identity: Identity,
    peer_identity: Identity,
    my_ephemeral_public: PublicKey,
    /// Kept by the initiator until the Accept arrives; the responder never stores it.
    my_ephemeral_secret: Option<SecretKey>,
    peer_ephemeral_public: Option<PublicKey>,
    my_ratchet_2dh: Option<KdfRatchet>,
    my_ratchet_4dh: Option<KdfRatchet>,
    peer_ratchet_2dh: Option<KdfRatchet>,
    peer_ratchet_4dh: Option<KdfRatchet>,
    negotiated_version: Version,
    announced_version: Version,
}

impl DhSession {
    /// Creates a new session as initiator.
    ///
    /// Generates a fresh ephemeral key pair and seeds the 2DH send chain from
    /// `DH(my_ephemeral, peer_identity)`. The matching Init envelope must be sent to the peer by
    /// the caller.
    pub fn initiate(
        my_identity: Identity,
        contact: &Contact,
        rng: &Rng,
    ) -> Result<Self, SessionError> {
        let id = SessionId::random(rng)?;
        let ephemeral_secret = SecretKey::generate(rng)?;
        let ephemeral_public = ephemeral_secret.public_key();

        let shared = x25519(&ephemeral_secret, &contact.public_key)?;
        let my_ratchet_2dh = KdfRatchet::new(hkdf_derive(&[shared.as_bytes()], INFO_2DH));

        Ok(Self {
            id,
            my_identity,
            peer_identity: contact.identity.clone(),
            my_ephemeral_public: ephemeral_public,
            my_ephemeral_secret: Some(ephemeral_secret),
            peer_ephemeral_public: None,
            my_ratchet_2dh: Some(my_ratchet_2dh),
            my_ratchet_4dh: None,
            peer_ratchet_2dh: None,
            peer_ratchet_4dh: None,
            negotiated_version: crate::version::SUPPORTED_VERSION_MIN,
            announced_version: crate::version::SUPPORTED_VERSION_MIN,
        })
    }

    /// Creates a new session as responder to a received Init.
    ///
    /// The responder generates its own ephemeral key pair and can derive everything at once: the
    /// 2DH receive chain (mirroring the initiator's send chain) plus both 4DH chains. Its own 2DH
    /// send chain never exists since the responder only starts sending after this point, in 4DH.
    pub fn respond(
        id: SessionId,
        my_identity: Identity,
        my_secret: &SecretKey,
        contact: &Contact,
        peer_version_range: VersionRange,
        peer_ephemeral: PublicKey,
        rng: &Rng,
    ) -> Result<Self, SessionError> {
        let negotiated = peer_version_range.negotiate()?;

        let ephemeral_secret = SecretKey::generate(rng)?;
        let ephemeral_public = ephemeral_secret.public_key();

        // Initiator's 2DH send chain seed is DH(their ephemeral, our identity).
        let shared_2dh = x25519(my_secret, &peer_ephemeral)?;
        let peer_ratchet_2dh = KdfRatchet::new(hkdf_derive(&[shared_2dh.as_bytes()], INFO_2DH));

        // Four shared secrets in role-canonical order: ephemeral x ephemeral, initiator ephemeral
        // x responder identity, initiator identity x responder ephemeral, identity x identity.
        let dh_ee = x25519(&ephemeral_secret, &peer_ephemeral)?;
        let dh_slot2 = x25519(my_secret, &peer_ephemeral)?;
        let dh_slot3 = x25519(&ephemeral_secret, &contact.public_key)?;
        let dh_ii = x25519(my_secret, &contact.public_key)?;
        let seed = [
            dh_ee.as_bytes().as_slice(),
            dh_slot2.as_bytes().as_slice(),
            dh_slot3.as_bytes().as_slice(),
            dh_ii.as_bytes().as_slice(),
        ];

        let my_ratchet_4dh = KdfRatchet::new(hkdf_derive(&seed, INFO_4DH_RESPONDER));
        let peer_ratchet_4dh = KdfRatchet::new(hkdf_derive(&seed, INFO_4DH_INITIATOR));

        Ok(Self {
            id,
            my_identity,
            peer_identity: contact.identity.clone(),
            my_ephemeral_public: ephemeral_public,
            my_ephemeral_secret: None,
            peer_ephemeral_public: Some(peer_ephemeral),
            my_ratchet_2dh: None,
            my_ratchet_4dh: Some(my_ratchet_4dh),
            peer_ratchet_2dh: Some(peer_ratchet_2dh),
            peer_ratchet_4dh: Some(peer_ratchet_4dh),
            negotiated_version: negotiated,
            announced_version: negotiated,
        })
    }

    /// Processes the peer's Accept on the initiator side, deriving the 4DH chains and committing
    /// the negotiated version.
    ///
    /// Fails when this session holds no ephemeral secret any more, which means the Accept cannot
    /// belong to the stored handshake.
    pub fn process_accept(
        &mut self,
        my_secret: &SecretKey,
        contact: &Contact,
        peer_version_range: VersionRange,
        peer_ephemeral: PublicKey,
    ) -> Result<(), SessionError> {
        let ephemeral_secret = self
            .my_ephemeral_secret
            .take()
            .ok_or(SessionError::UnexpectedAccept(self.id))?;

        let negotiated = peer_version_range.negotiate()?;

        let dh_ee = x25519(&ephemeral_secret, &peer_ephemeral)?;
        let dh_slot2 = x25519(&ephemeral_secret, &contact.public_key)?;
        let dh_slot3 = x25519(my_secret, &peer_ephemeral)?;
        let dh_ii = x25519(my_secret, &contact.public_key)?;
        let seed = [
            dh_ee.as_bytes().as_slice(),
            dh_slot2.as_bytes().as_slice(),
            dh_slot3.as_bytes().as_slice(),
            dh_ii.as_bytes().as_slice(),
        ];

        self.my_ratchet_4dh = Some(KdfRatchet::new(hkdf_derive(&seed, INFO_4DH_INITIATOR)));
        self.peer_ratchet_4dh = Some(KdfRatchet::new(hkdf_derive(&seed, INFO_4DH_RESPONDER)));

        // 4DH is established in both directions now; the 2DH send chain must never be used again.
        self.my_ratchet_2dh = None;
        self.peer_ephemeral_public = Some(peer_ephemeral);

        self.commit_negotiated_version(negotiated);

        Ok(())
    }

    /// Checks the version a received message claims to be encoded with against the session.
    ///
    /// Accepts only versions of the same major generation as the currently negotiated one and
    /// returns the possibly-raised negotiated version; `None` signals a hard mismatch that must
    /// lead to rejection of the message.
    pub fn validate_applied_version(&self, applied_raw: u16) -> Option<Version> {
        let applied = Version::from_u16_lossy(applied_raw);
        if applied.major() != self.negotiated_version.major() {
            return None;
        }
        Some(self.negotiated_version.max(applied))
    }

    /// Persists a version raise; the negotiated version never decreases.
    pub fn commit_negotiated_version(&mut self, version: Version) {
        if version > self.negotiated_version {
            self.negotiated_version = version;
        }
        if self.negotiated_version > self.announced_version {
            self.announced_version = self.negotiated_version;
        }
    }

    /// Drops the peer's 2DH receive chain once a 4DH message from them has been processed.
    pub fn discard_peer_ratchet_2dh(&mut self) {
        self.peer_ratchet_2dh = None;
    }

    /// Derives the lifecycle state from ratchet presence.
    pub fn state(&self) -> Result<SessionState, SessionError> {
        match (
            &self.my_ratchet_2dh,
            &self.my_ratchet_4dh,
            &self.peer_ratchet_2dh,
            &self.peer_ratchet_4dh,
        ) {
            (Some(_), None, None, None) => Ok(SessionState::InitiatorHandshake),
            (None, Some(_), Some(_), Some(_)) => Ok(SessionState::ResponderHandshake),
            (None, Some(_), None, Some(_)) => Ok(SessionState::Established),
            _ => Err(SessionError::InvalidState(self.id)),
        }
    }

    /// True while no 4DH chain exists, i.e. only the initiator's 2DH send chain is present.
    pub fn is_2dh_only(&self) -> bool {
        self.my_ratchet_4dh.is_none() && self.peer_ratchet_4dh.is_none()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn my_identity(&self) -> &Identity {
        &self.my_identity
    }

    pub fn peer_identity(&self) -> &Identity {
        &self.peer_identity
    }

    pub fn my_ephemeral_public(&self) -> PublicKey {
        self.my_ephemeral_public
    }

    pub fn negotiated_version(&self) -> Version {
        self.negotiated_version
    }

    pub fn announced_version(&self) -> Version {
        self.announced_version
    }

    /// Send chain to use for the next outgoing message: 4DH when established, otherwise 2DH.
    pub fn my_ratchet(&mut self) -> Option<(&mut KdfRatchet, DhType)> {
        if let Some(ratchet) = self.my_ratchet_4dh.as_mut() {
            return Some((ratchet, DhType::FourDh));
        }
        self.my_ratchet_2dh
            .as_mut()
            .map(|ratchet| (ratchet, DhType::TwoDh))
    }

    /// Receive chain for the declared DH type of an incoming message.
    pub fn peer_ratchet(&mut self, dh_type: DhType) -> Option<&mut KdfRatchet> {
        match dh_type {
            DhType::TwoDh => self.peer_ratchet_2dh.as_mut(),
            DhType::FourDh => self.peer_ratchet_4dh.as_mut(),
        }
    }

    pub fn peer_ratchet_2dh(&self) -> Option<&KdfRatchet> {
        self.peer_ratchet_2dh.as_ref()
    }

    pub fn peer_ratchet_4dh(&self) -> Option<&KdfRatchet> {
        self.peer_ratchet_4dh.as_ref()
    }
}

impl fmt::Display for DhSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} with {} ({}, negotiated {})",
            self.id,
            self.peer_identity,
            match self.state() {
                Ok(state) => format!("{state:?}"),
                Err(_) => "invalid state".to_string(),
            },
            self.negotiated_version,
        )
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("accept does not match the stored handshake state of session {0}")]
    UnexpectedAccept(SessionId),

    #[error("session {0} has an invalid combination of ratchet chains")]
    InvalidState(SessionId),
}
