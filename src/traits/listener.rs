// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::envelope::{MessageId, RejectCause};
use crate::session::{DhSession, SessionId};
use crate::traits::Contact;
use crate::version::Version;

/// Status and failure notifications emitted by the protocol engine.
///
/// All methods default to no-ops so applications only implement what they surface. The engine
/// holds the listener as an optional configuration value; when none is set every notification is
/// simply dropped.
#[allow(unused_variables)]
pub trait StatusListener {
    /// We created a new session and sent an Init for it.
    fn new_session_initiated(&self, session: &DhSession, contact: &Contact) {}

    /// We answered a peer's Init. `existing_session_preempted` is true when stale 4DH sessions
    /// had to be deleted for it.
    fn responder_session_established(
        &self,
        session: &DhSession,
        contact: &Contact,
        existing_session_preempted: bool,
    ) {
    }

    /// The peer accepted our Init and the session reached 4DH.
    fn initiator_session_established(&self, session: &DhSession, contact: &Contact) {}

    /// The peer rejected one of our messages. `session_unknown` is true when we did not even
    /// know the referenced session anymore.
    fn reject_received(
        &self,
        session_id: SessionId,
        rejected_message_id: MessageId,
        cause: RejectCause,
        contact: &Contact,
        session_unknown: bool,
    ) {
    }

    /// An Accept referenced a session we do not know.
    fn session_not_found(&self, session_id: SessionId, contact: &Contact) {}

    /// A message envelope referenced a session we do not know.
    fn session_for_message_not_found(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        contact: &Contact,
    ) {
    }

    /// The peer sent with a DH mode the session has no chain for (e.g. a lost Accept).
    fn session_bad_state(&self, session_id: SessionId, contact: &Contact) {}

    /// The peer terminated a session.
    fn session_terminated(&self, session_id: SessionId, contact: &Contact) {}

    /// Messages were skipped; the ratchet had to turn `num_skipped` extra steps.
    fn messages_skipped(&self, session_id: SessionId, contact: &Contact, num_skipped: u64) {}

    /// A message arrived for a counter whose key is already gone; it is permanently lost.
    fn message_out_of_order(&self, session_id: SessionId, contact: &Contact, message_id: MessageId) {
    }

    /// Authentication of a ciphertext failed.
    fn message_decryption_failed(
        &self,
        session_id: SessionId,
        contact: &Contact,
        message_id: MessageId,
    ) {
    }

    /// First 4DH message of a session was received; the strongest mode is confirmed now.
    fn first_4dh_message_received(&self, session: &DhSession, contact: &Contact) {}

    /// A message applied a version whose major generation does not match the session.
    fn unexpected_applied_version(
        &self,
        session: &DhSession,
        applied_version: u16,
        contact: &Contact,
    ) {
    }

    /// Processing a message raised the negotiated version.
    fn negotiated_version_updated(
        &self,
        session: &DhSession,
        negotiated_version: Version,
        contact: &Contact,
    ) {
    }

    /// A plain message arrived although the session and the peer's capabilities suggest it
    /// should have been forward-secure; a possible downgrade signal.
    fn message_without_fs_received(&self, contact: &Contact, session: &DhSession) {}

    /// Whether the contact's capability mask still claims forward-secrecy support.
    ///
    /// Defaults to true: a false positive only leaves a session around for one more failed
    /// initiation attempt, while a false negative would tear down working sessions.
    fn has_forward_secrecy_support(&self, contact: &Contact) -> bool {
        true
    }

    /// Ask the directory to refresh the contact's capability mask.
    fn update_feature_mask(&self, contact: &Contact) {}
}

/// Failure collaborator for rejected outer messages, so the excluded layer can re-queue or
/// surface them.
pub trait FailureListener {
    fn notify_reject_received(&self, contact: &Contact, rejected_message_id: MessageId);
}
