// SPDX-License-Identifier: MIT OR Apache-2.0

//! `pfs-session` implements a per-contact forward-secrecy ("PFS") session protocol: X25519
//! session establishment, KDF ratchets deriving one-time message keys, and the envelope state
//! machine that encapsulates application messages inside forward-secure transport frames.
//!
//! ## Protocol
//!
//! A session starts when one side (the initiator) sends an `Init` envelope carrying a fresh
//! ephemeral public key and its supported version range. From that moment the initiator can
//! already send messages in **2DH** mode, with a ratchet seeded from a single Diffie-Hellman
//! computation against the peer's long-term identity key. The responder answers with an `Accept`
//! carrying its own ephemeral key, after which both sides derive the **4DH** ratchets from four
//! Diffie-Hellman computations mixing both ephemeral and both identity keys. 4DH is the final
//! mode; once a 4DH message from the peer is seen, its 2DH receive chain is discarded for good.
//!
//! Every message consumes exactly one ratchet key: the chain key is replaced by a one-way
//! derived successor on each turn and the previous key is zeroized, so compromise of current
//! state never reveals keys of already-delivered messages.
//!
//! ## Integration
//!
//! The [`engine::ForwardSecurityEngine`] is the single entry point. It is generic over the
//! collaborators an application provides through the [`traits`] module: a durable session store,
//! the contact directory, our identity key material, the outbound transport queue and an
//! optional status listener surfacing session lifecycle events. The outer application message
//! codec and the transport itself are out of scope; the engine only sees opaque
//! `[type_byte][body]` payloads.
//!
//! Versions are negotiated per session as the minimum of both peers' advertised capabilities and
//! never decrease once raised.
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod ratchet;
pub mod session;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;
pub mod version;

pub use crypto::{Rng, RngError};
pub use engine::{EngineError, ForwardSecurityEngine};
pub use session::{DhSession, DhType, SessionId, SessionState};
pub use version::{SUPPORTED_VERSION_MAX, SUPPORTED_VERSION_MIN, SUPPORTED_VERSION_RANGE, Version};
