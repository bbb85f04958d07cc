// SPDX-License-Identifier: MIT OR Apache-2.0

//! The envelope dispatcher and session lifecycle state machine.
//!
//! One engine instance serves all contacts. Processing an inbound envelope or encapsulating an
//! outbound message runs under a single engine-wide lock covering lookup, mutation, persistence
//! and any immediate counter-messages as one atomic unit; session supersession can touch several
//! sessions of a peer pair and must never observe a half-applied state.
//!
//! Protocol-level failures (unknown session, state mismatch, failed authentication) never abort
//! the engine: they answer with a Reject or Terminate envelope, notify the status listener and
//! consume the message.
use std::sync::Mutex;
use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crypto::x25519::PublicKey;
use crate::crypto::xchacha20::{XAeadError, ZERO_NONCE, xaead_open, xaead_seal};
use crate::crypto::{Rng, RngError};
use crate::envelope::{
    DecryptedMessage, Envelope, EnvelopeData, MessageData, MessageId, OutgoingMessage,
    PlainMessage, RejectCause, TerminateCause,
};
use crate::ratchet::RatchetError;
use crate::session::{DhSession, DhType, SessionError, SessionId, SessionState};
use crate::traits::{
    Contact, ContactStore, FailureListener, IdentityStore, MessageQueue, QueueError, SessionStore,
    SessionStoreError, StatusListener,
};
use crate::version::{SUPPORTED_VERSION_MIN, SUPPORTED_VERSION_RANGE, Version, VersionRange};

/// Forward-secrecy protocol engine.
///
/// Generic over its collaborators: the durable session store, the contact directory, our own
/// identity key material, the outbound transport queue and the failure listener for rejected
/// messages. The status listener is optional configuration, set after construction.
pub struct ForwardSecurityEngine<S, C, I, Q, F> {
    sessions: S,
    contacts: C,
    identity: I,
    queue: Q,
    failure_listener: F,
    status_listener: Option<Box<dyn StatusListener + Send + Sync>>,
    rng: Rng,
    lock: Mutex<()>,
}

impl<S, C, I, Q, F> ForwardSecurityEngine<S, C, I, Q, F>
where
    S: SessionStore,
    C: ContactStore,
    I: IdentityStore,
    Q: MessageQueue,
    F: FailureListener,
{
    pub fn new(sessions: S, contacts: C, identity: I, queue: Q, failure_listener: F, rng: Rng) -> Self {
        Self {
            sessions,
            contacts,
            identity,
            queue,
            failure_listener,
            status_listener: None,
            rng,
            lock: Mutex::new(()),
        }
    }

    /// Configures the status listener receiving session lifecycle and failure notifications.
    pub fn set_status_listener(&mut self, listener: Box<dyn StatusListener + Send + Sync>) {
        self.status_listener = Some(listener);
    }

    /// Processes an inbound forward-security envelope.
    ///
    /// Control envelopes are consumed and return `None`; message envelopes return the
    /// decapsulated inner message unless a protocol-level failure consumed it.
    pub fn process_envelope(
        &self,
        sender: &Contact,
        envelope: &Envelope,
    ) -> Result<Option<DecryptedMessage>, EngineError> {
        let _guard = self.lock.lock().map_err(|_| EngineError::LockPoisoned)?;

        match &envelope.data {
            EnvelopeData::Init {
                session_id,
                version_range,
                ephemeral_public_key,
            } => {
                self.process_init(sender, *session_id, *version_range, *ephemeral_public_key)?;
                Ok(None)
            }
            EnvelopeData::Accept {
                session_id,
                version_range,
                ephemeral_public_key,
            } => {
                self.process_accept(sender, *session_id, *version_range, *ephemeral_public_key)?;
                Ok(None)
            }
            EnvelopeData::Reject {
                session_id,
                rejected_message_id,
                cause,
            } => {
                self.process_reject(sender, *session_id, *rejected_message_id, *cause)?;
                Ok(None)
            }
            EnvelopeData::Terminate { session_id, cause } => {
                self.process_terminate(sender, *session_id, *cause)?;
                Ok(None)
            }
            EnvelopeData::Message(message) => self.process_message(sender, envelope, message),
        }
    }

    /// Encapsulates an application message in a forward-secure envelope towards a contact.
    ///
    /// When no session exists yet, a new one is initiated: the session is stored and the Init
    /// enqueued before the message's minimum version requirement is checked, so a failed check
    /// leaves the fresh session in place for later messages.
    pub fn make_message(
        &self,
        contact: &Contact,
        inner: &OutgoingMessage,
    ) -> Result<Envelope, EngineError> {
        let _guard = self.lock.lock().map_err(|_| EngineError::LockPoisoned)?;

        let my_identity = self.identity.identity();
        let mut session = match self.sessions.best_session(&my_identity, &contact.identity)? {
            Some(session) => session,
            None => {
                let session = DhSession::initiate(my_identity, contact, &self.rng)?;
                self.sessions.store_session(&session)?;
                debug!(session = %session.id(), peer = %contact.identity, "starting new session");
                self.notify(|listener| listener.new_session_initiated(&session, contact));

                self.send_to_contact(
                    contact,
                    EnvelopeData::Init {
                        session_id: session.id(),
                        version_range: SUPPORTED_VERSION_RANGE,
                        ephemeral_public_key: session.my_ephemeral_public(),
                    },
                )?;

                match inner.required_version {
                    Some(required) if required <= SUPPORTED_VERSION_MIN => {}
                    _ => {
                        return Err(EngineError::MessageTypeNotSupported {
                            required: inner.required_version,
                            negotiated: SUPPORTED_VERSION_MIN,
                        });
                    }
                }
                session
            }
        };

        match inner.required_version {
            Some(required) if required <= session.negotiated_version() => {}
            _ => {
                return Err(EngineError::MessageTypeNotSupported {
                    required: inner.required_version,
                    negotiated: session.negotiated_version(),
                });
            }
        }

        let session_id = session.id();
        let announced_version = session.announced_version();
        let (key, counter, dh_type) = {
            let (ratchet, dh_type) = session
                .my_ratchet()
                .ok_or(EngineError::BadDhState(session_id))?;
            let key = ratchet.current_encryption_key();
            let counter = ratchet.counter();
            ratchet.turn();
            (key, counter, dh_type)
        };

        // The turned ratchet must be durable before the ciphertext can leave.
        self.sessions.store_session(&session)?;

        let mut plaintext = Vec::with_capacity(1 + inner.body.len());
        plaintext.push(inner.message_type);
        plaintext.extend_from_slice(&inner.body);

        // One-time key, therefore the all-zero nonce is safe.
        let ciphertext = xaead_seal(&key, ZERO_NONCE, &plaintext)?;
        drop(key);

        Ok(Envelope {
            to_identity: inner.to_identity.clone(),
            message_id: inner.message_id,
            created_at: inner.created_at,
            flags: inner.flags,
            data: EnvelopeData::Message(MessageData {
                session_id,
                dh_type,
                counter,
                applied_version: announced_version.to_u16(),
                ciphertext,
            }),
        })
    }

    /// Deletes every session with the peer, sending a Terminate for each.
    ///
    /// Local deletion always precedes the outbound notification, so a crash mid-loop cannot
    /// resurrect a session the peer already believes terminated.
    pub fn clear_and_terminate_all_sessions(
        &self,
        contact: &Contact,
        cause: TerminateCause,
    ) -> Result<(), EngineError> {
        let _guard = self.lock.lock().map_err(|_| EngineError::LockPoisoned)?;
        self.clear_and_terminate_locked(contact, cause)
            .inspect_err(|err| {
                error!(peer = %contact.identity, "could not clear and terminate sessions: {err}");
            })
    }

    /// Checks a plain inbound message against the forward-security state with its sender.
    ///
    /// When a session exists under which the message type should have been encapsulated and the
    /// peer's capability mask still claims forward-secrecy support, the capability mask is
    /// refreshed and a downgrade signal is raised towards the application. Advisory only; store
    /// failures are logged, never surfaced.
    pub fn warn_if_message_without_forward_security_received(&self, message: &PlainMessage) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let Some(contact) = self.contacts.contact_for_identity(&message.from_identity) else {
            return;
        };
        let best_session = match self
            .sessions
            .best_session(&self.identity.identity(), &message.from_identity)
        {
            Ok(best_session) => best_session,
            Err(err) => {
                error!(peer = %message.from_identity, "could not get best session: {err}");
                return;
            }
        };
        let Some(session) = best_session else {
            return;
        };

        // While the peer may still be sending 2DH we can only assume the minimum version for
        // incoming messages; otherwise they are expected to apply the negotiated one.
        let assumed_version = match session.state() {
            Ok(SessionState::ResponderHandshake) => SUPPORTED_VERSION_MIN,
            _ => session.negotiated_version(),
        };

        let Some(required_version) = message.required_version else {
            return;
        };
        if required_version <= assumed_version {
            if self.has_forward_secrecy_support(&contact) {
                self.notify(|listener| listener.update_feature_mask(&contact));
            }
            // Re-check: the mask may just have been refreshed to reflect a downgrade, in which
            // case the application shows a downgrade status instead.
            if self.has_forward_secrecy_support(&contact) {
                self.notify(|listener| listener.message_without_fs_received(&contact, &session));
            }
        }
    }

    fn process_init(
        &self,
        contact: &Contact,
        session_id: SessionId,
        version_range: VersionRange,
        ephemeral_public_key: PublicKey,
    ) -> Result<(), EngineError> {
        let my_identity = self.identity.identity();

        // An Init for a session we already know is a retry; silently discard it.
        if self
            .sessions
            .get_session(&my_identity, &contact.identity, &session_id)?
            .is_some()
        {
            return Ok(());
        }

        // The initiator only sends an Init when it has no session, so our stored 4DH sessions
        // with them are obsolete. 2DH sessions (initiated by us) are kept, otherwise messages
        // could be lost during an Init race.
        let existing_session_preempted = self
            .sessions
            .delete_all_except(&my_identity, &contact.identity, &session_id, true)?
            > 0;

        let session = DhSession::respond(
            session_id,
            my_identity,
            self.identity.secret_key(),
            contact,
            version_range,
            ephemeral_public_key,
            &self.rng,
        )?;
        self.sessions.store_session(&session)?;
        debug!(session = %session.id(), peer = %contact.identity, "responding to new session request");
        self.notify(|listener| {
            listener.responder_session_established(&session, contact, existing_session_preempted)
        });

        if !self.has_forward_secrecy_support(contact) {
            self.notify(|listener| listener.update_feature_mask(contact));
        }

        if self.has_forward_secrecy_support(contact) {
            self.send_to_contact(
                contact,
                EnvelopeData::Accept {
                    session_id,
                    version_range: SUPPORTED_VERSION_RANGE,
                    ephemeral_public_key: session.my_ephemeral_public(),
                },
            )?;
        } else {
            // The peer's capability mask says no forward secrecy; tear the session down again.
            self.clear_and_terminate_locked(contact, TerminateCause::DisabledByRemote)?;
        }

        Ok(())
    }

    fn process_accept(
        &self,
        contact: &Contact,
        session_id: SessionId,
        version_range: VersionRange,
        ephemeral_public_key: PublicKey,
    ) -> Result<(), EngineError> {
        let my_identity = self.identity.identity();
        let Some(mut session) =
            self.sessions
                .get_session(&my_identity, &contact.identity, &session_id)?
        else {
            // Probably lost local data or a stale accept.
            warn!(session = %session_id, peer = %contact.identity, "no session found for accept");
            self.send_to_contact(
                contact,
                EnvelopeData::Terminate {
                    session_id,
                    cause: TerminateCause::UnknownSession,
                },
            )?;
            self.notify(|listener| listener.session_not_found(session_id, contact));
            return Ok(());
        };

        session.process_accept(
            self.identity.secret_key(),
            contact,
            version_range,
            ephemeral_public_key,
        )?;
        self.sessions.store_session(&session)?;
        info!(
            session = %session.id(),
            peer = %contact.identity,
            negotiated = %session.negotiated_version(),
            "established 4DH session"
        );
        self.notify(|listener| listener.initiator_session_established(&session, contact));

        Ok(())
    }

    fn process_reject(
        &self,
        contact: &Contact,
        session_id: SessionId,
        rejected_message_id: MessageId,
        cause: RejectCause,
    ) -> Result<(), EngineError> {
        warn!(session = %session_id, peer = %contact.identity, ?cause, "received reject");

        let my_identity = self.identity.identity();
        let session = self
            .sessions
            .get_session(&my_identity, &contact.identity, &session_id)?;
        let session_unknown = session.is_none();
        if session.is_some() {
            self.sessions
                .delete_session(&my_identity, &contact.identity, &session_id)?;
        } else {
            info!(session = %session_id, peer = %contact.identity, "no session found for reject");
        }

        self.notify(|listener| {
            listener.reject_received(session_id, rejected_message_id, cause, contact, session_unknown)
        });

        // The peer may have downgraded to a build without forward secrecy.
        self.notify(|listener| listener.update_feature_mask(contact));

        self.failure_listener
            .notify_reject_received(contact, rejected_message_id);

        Ok(())
    }

    fn process_terminate(
        &self,
        contact: &Contact,
        session_id: SessionId,
        cause: TerminateCause,
    ) -> Result<(), EngineError> {
        debug!(session = %session_id, peer = %contact.identity, ?cause, "terminating session");

        let my_identity = self.identity.identity();
        match self
            .sessions
            .delete_session(&my_identity, &contact.identity, &session_id)
        {
            // Tolerate sessions that are already gone.
            Ok(()) | Err(SessionStoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        self.notify(|listener| listener.session_terminated(session_id, contact));
        self.notify(|listener| listener.update_feature_mask(contact));

        Ok(())
    }

    fn process_message(
        &self,
        contact: &Contact,
        envelope: &Envelope,
        message: &MessageData,
    ) -> Result<Option<DecryptedMessage>, EngineError> {
        let my_identity = self.identity.identity();
        let Some(mut session) =
            self.sessions
                .get_session(&my_identity, &contact.identity, &message.session_id)?
        else {
            warn!(
                session = %message.session_id,
                peer = %contact.identity,
                message_id = %envelope.message_id,
                "no session found for message"
            );
            self.send_reject(contact, message, envelope, RejectCause::UnknownSession)?;
            self.notify(|listener| {
                listener.session_for_message_not_found(
                    message.session_id,
                    envelope.message_id,
                    contact,
                )
            });
            return Ok(None);
        };

        let Some(updated_version) = session.validate_applied_version(message.applied_version) else {
            warn!(
                session = %session.id(),
                negotiated = %session.negotiated_version(),
                applied = message.applied_version,
                "unexpected major version in applied version"
            );
            self.send_reject(contact, message, envelope, RejectCause::StateMismatch)?;
            self.notify(|listener| {
                listener.unexpected_applied_version(&session, message.applied_version, contact)
            });
            return Ok(None);
        };
        if updated_version > session.negotiated_version() {
            self.notify(|listener| {
                listener.negotiated_version_updated(&session, updated_version, contact)
            });
        }

        let (plaintext, counter_after) = {
            let Some(ratchet) = session.peer_ratchet(message.dh_type) else {
                // The peer believes a chain exists that we never completed, e.g. our Accept got
                // lost and they moved to 4DH without us.
                self.send_reject(contact, message, envelope, RejectCause::StateMismatch)?;
                self.notify(|listener| listener.session_bad_state(message.session_id, contact));
                return Ok(None);
            };

            // We are already at the correct count unless messages went missing in between.
            match ratchet.turn_until(message.counter) {
                Ok(0) => {}
                Ok(skipped) => {
                    self.notify(|listener| {
                        listener.messages_skipped(message.session_id, contact, skipped)
                    });
                }
                Err(err) => {
                    self.notify(|listener| {
                        listener.message_out_of_order(
                            message.session_id,
                            contact,
                            envelope.message_id,
                        )
                    });
                    return Err(EngineError::OutOfOrder(err));
                }
            }

            let key = ratchet.current_encryption_key();
            let Ok(plaintext) = xaead_open(&key, ZERO_NONCE, &message.ciphertext) else {
                self.send_reject(contact, message, envelope, RejectCause::StateMismatch)?;
                self.notify(|listener| {
                    listener.message_decryption_failed(
                        message.session_id,
                        contact,
                        envelope.message_id,
                    )
                });
                return Ok(None);
            };

            // The current key is consumed now and the peer's next message must come with a
            // higher counter.
            ratchet.turn();
            (plaintext, ratchet.counter())
        };

        debug!(
            session = %session.id(),
            peer = %contact.identity,
            message_id = %envelope.message_id,
            mode = %message.dh_type,
            applied = message.applied_version,
            "decrypted message"
        );

        session.commit_negotiated_version(updated_version);

        if message.dh_type == DhType::FourDh {
            // No further 2DH messages can arrive in this session; dropping the chain also makes
            // the session state unambiguous.
            if session.peer_ratchet_2dh().is_some() {
                session.discard_peer_ratchet_2dh();
            }

            // If this is also the best session with the peer, all others are now superseded.
            let best_session = self
                .sessions
                .best_session(&my_identity, &contact.identity)?;
            if best_session.map(|best| best.id()) == Some(session.id()) {
                self.sessions.delete_all_except(
                    &my_identity,
                    &contact.identity,
                    &session.id(),
                    false,
                )?;
            }

            if counter_after == 2 {
                self.notify(|listener| listener.first_4dh_message_received(&session, contact));
            }
        }

        self.sessions.store_session(&session)?;

        let Some((&message_type, body)) = plaintext.split_first() else {
            self.send_reject(contact, message, envelope, RejectCause::StateMismatch)?;
            self.notify(|listener| {
                listener.message_decryption_failed(message.session_id, contact, envelope.message_id)
            });
            return Ok(None);
        };

        Ok(Some(DecryptedMessage {
            session_id: session.id(),
            from_identity: contact.identity.clone(),
            message_id: envelope.message_id,
            created_at: envelope.created_at,
            flags: envelope.flags,
            message_type,
            body: body.to_vec(),
            mode: message.dh_type,
            applied_version: updated_version,
        }))
    }

    fn clear_and_terminate_locked(
        &self,
        contact: &Contact,
        cause: TerminateCause,
    ) -> Result<(), EngineError> {
        let my_identity = self.identity.identity();
        while let Some(session) = self.sessions.best_session(&my_identity, &contact.identity)? {
            self.sessions
                .delete_session(&my_identity, &contact.identity, &session.id())?;
            self.send_to_contact(
                contact,
                EnvelopeData::Terminate {
                    session_id: session.id(),
                    cause,
                },
            )?;
        }
        Ok(())
    }

    fn send_reject(
        &self,
        contact: &Contact,
        message: &MessageData,
        envelope: &Envelope,
        cause: RejectCause,
    ) -> Result<(), EngineError> {
        self.send_to_contact(
            contact,
            EnvelopeData::Reject {
                session_id: message.session_id,
                rejected_message_id: envelope.message_id,
                cause,
            },
        )
    }

    fn send_to_contact(&self, contact: &Contact, data: EnvelopeData) -> Result<(), EngineError> {
        let envelope = Envelope {
            to_identity: contact.identity.clone(),
            message_id: MessageId::random(&self.rng)?,
            created_at: SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64,
            flags: 0,
            data,
        };
        self.queue.enqueue(envelope)?;
        Ok(())
    }

    fn notify<N>(&self, notification: N)
    where
        N: FnOnce(&(dyn StatusListener + Send + Sync)),
    {
        if let Some(listener) = &self.status_listener {
            notification(listener.as_ref());
        }
    }

    fn has_forward_secrecy_support(&self, contact: &Contact) -> bool {
        self.status_listener
            .as_ref()
            .map(|listener| listener.has_forward_secrecy_support(contact))
            .unwrap_or(true)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The inner message's type requires a newer protocol version than the session negotiated.
    #[error("message type not supported in session, negotiated version is {negotiated}")]
    MessageTypeNotSupported {
        required: Option<Version>,
        negotiated: Version,
    },

    /// The session has neither a 4DH nor a 2DH send chain.
    #[error("no DH mode negotiated in session {0}")]
    BadDhState(SessionId),

    /// The key for this message was already consumed; it is permanently undecryptable.
    #[error("out of order message, cannot decrypt: {0}")]
    OutOfOrder(#[source] RatchetError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Aead(#[from] XAeadError),

    #[error(transparent)]
    SystemTime(#[from] SystemTimeError),

    #[error("engine lock is poisoned")]
    LockPoisoned,
}
