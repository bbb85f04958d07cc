// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport envelopes of the forward-secrecy protocol and the boundary types exchanged with the
//! application message codec.
//!
//! The five envelope kinds form a closed sum type which the engine matches exhaustively; adding a
//! kind is a compile error until it is handled everywhere.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, RngError};
use crate::session::{DhType, SessionId};
use crate::traits::Identity;
use crate::version::{Version, VersionRange};

pub const MESSAGE_ID_SIZE: usize = 8;

/// Identifier of an outer transport message.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "serde_bytes")] [u8; MESSAGE_ID_SIZE]);

impl MessageId {
    pub fn from_bytes(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

/// Why a message envelope was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCause {
    UnknownSession,
    StateMismatch,
}

/// Why a session was terminated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminateCause {
    Reset,
    DisabledByRemote,
    UnknownSession,
}

/// Payload of a forward-secrecy envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeData {
    /// Offer to establish a new session, carrying the initiator's fresh ephemeral key.
    Init {
        session_id: SessionId,
        version_range: VersionRange,
        ephemeral_public_key: PublicKey,
    },

    /// Responder's answer to an Init, carrying their own fresh ephemeral key.
    Accept {
        session_id: SessionId,
        version_range: VersionRange,
        ephemeral_public_key: PublicKey,
    },

    /// A message envelope could not be processed; the referenced outer message should be
    /// re-queued or surfaced by the application.
    Reject {
        session_id: SessionId,
        rejected_message_id: MessageId,
        cause: RejectCause,
    },

    /// The sender has deleted the referenced session.
    Terminate {
        session_id: SessionId,
        cause: TerminateCause,
    },

    /// An encapsulated application message.
    Message(MessageData),
}

/// Wire fields of an encapsulated application message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub session_id: SessionId,
    pub dh_type: DhType,
    /// Ratchet counter value naming the one-time key this message was encrypted with.
    pub counter: u64,
    /// Version the sender claims to have encoded the inner message with; raw wire value since
    /// the sender may be ahead of us.
    pub applied_version: u16,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Outer transport frame around [`EnvelopeData`].
///
/// For encapsulated messages the routing metadata is copied from the inner message; for control
/// envelopes a fresh message id is generated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub to_identity: Identity,
    pub message_id: MessageId,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    pub flags: u32,
    pub data: EnvelopeData,
}

/// An application message to be encapsulated in a forward-secure envelope.
///
/// Encoding of `message_type` and `body` is owned by the application codec; this crate only
/// prepends the type byte to the body before encryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to_identity: Identity,
    pub message_id: MessageId,
    pub created_at: u64,
    pub flags: u32,
    pub message_type: u8,
    pub body: Vec<u8>,
    /// Minimum protocol version the message type requires; `None` means the type may not be sent
    /// with forward secrecy at all.
    pub required_version: Option<Version>,
}

/// A successfully decapsulated application message, handed back to the application codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub session_id: SessionId,
    pub from_identity: Identity,
    pub message_id: MessageId,
    pub created_at: u64,
    pub flags: u32,
    pub message_type: u8,
    pub body: Vec<u8>,
    /// Which DH mode protected this message.
    pub mode: DhType,
    /// Negotiated version in effect after processing this message.
    pub applied_version: Version,
}

/// A plain (non-forward-secure) inbound message, as far as this crate needs to know about it.
///
/// Used by the downgrade warning path only.
#[derive(Clone, Debug)]
pub struct PlainMessage {
    pub from_identity: Identity,
    /// Minimum version under which this message type would have been required to use forward
    /// secrecy; `None` for types that never are.
    pub required_version: Option<Version>,
}

impl EnvelopeData {
    pub fn session_id(&self) -> SessionId {
        match self {
            EnvelopeData::Init { session_id, .. }
            | EnvelopeData::Accept { session_id, .. }
            | EnvelopeData::Reject { session_id, .. }
            | EnvelopeData::Terminate { session_id, .. } => *session_id,
            EnvelopeData::Message(message) => message.session_id,
        }
    }
}

impl fmt::Display for EnvelopeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            EnvelopeData::Init { .. } => "Init",
            EnvelopeData::Accept { .. } => "Accept",
            EnvelopeData::Reject { .. } => "Reject",
            EnvelopeData::Terminate { .. } => "Terminate",
            EnvelopeData::Message(_) => "Message",
        };
        write!(f, "{} ({})", kind, self.session_id())
    }
}
