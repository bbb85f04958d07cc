// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementations of all engine collaborators for tests and examples.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::x25519::SecretKey;
use crate::envelope::{Envelope, MessageId, RejectCause};
use crate::session::{DhSession, SessionId};
use crate::traits::{
    Contact, ContactStore, FailureListener, Identity, IdentityStore, MessageQueue, QueueError,
    SessionStore, SessionStoreError, StatusListener,
};
use crate::version::Version;

type PairKey = (Identity, Identity);

/// Session store keeping everything in a map, ordered by session id per peer pair.
///
/// Clones share the same underlying map so tests can inspect state the engine owns.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<PairKey, BTreeMap<SessionId, DhSession>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions stored for a peer pair.
    pub fn count(&self, my_identity: &Identity, peer_identity: &Identity) -> usize {
        let sessions = self.sessions.lock().expect("session store lock");
        sessions
            .get(&(my_identity.clone(), peer_identity.clone()))
            .map(|pair| pair.len())
            .unwrap_or(0)
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
        session_id: &SessionId,
    ) -> Result<Option<DhSession>, SessionStoreError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Backend("lock poisoned".to_string()))?;
        Ok(sessions
            .get(&(my_identity.clone(), peer_identity.clone()))
            .and_then(|pair| pair.get(session_id))
            .cloned())
    }

    fn best_session(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
    ) -> Result<Option<DhSession>, SessionStoreError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Backend("lock poisoned".to_string()))?;
        Ok(sessions
            .get(&(my_identity.clone(), peer_identity.clone()))
            .and_then(|pair| pair.values().next())
            .cloned())
    }

    fn store_session(&self, session: &DhSession) -> Result<(), SessionStoreError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Backend("lock poisoned".to_string()))?;
        sessions
            .entry((session.my_identity().clone(), session.peer_identity().clone()))
            .or_default()
            .insert(session.id(), session.clone());
        Ok(())
    }

    fn delete_session(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
        session_id: &SessionId,
    ) -> Result<(), SessionStoreError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Backend("lock poisoned".to_string()))?;
        let removed = sessions
            .get_mut(&(my_identity.clone(), peer_identity.clone()))
            .and_then(|pair| pair.remove(session_id));
        match removed {
            Some(_) => Ok(()),
            None => Err(SessionStoreError::NotFound(*session_id)),
        }
    }

    fn delete_all_except(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
        keep_id: &SessionId,
        keep_two_dh: bool,
    ) -> Result<usize, SessionStoreError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Backend("lock poisoned".to_string()))?;
        let Some(pair) = sessions.get_mut(&(my_identity.clone(), peer_identity.clone())) else {
            return Ok(0);
        };
        let before = pair.len();
        pair.retain(|session_id, session| {
            session_id == keep_id || (keep_two_dh && session.is_2dh_only())
        });
        Ok(before - pair.len())
    }
}

/// Contact directory backed by a map.
#[derive(Clone, Default)]
pub struct MemoryContactStore {
    contacts: Arc<Mutex<HashMap<Identity, Contact>>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, contact: Contact) {
        let mut contacts = self.contacts.lock().expect("contact store lock");
        contacts.insert(contact.identity.clone(), contact);
    }
}

impl ContactStore for MemoryContactStore {
    fn contact_for_identity(&self, identity: &Identity) -> Option<Contact> {
        let contacts = self.contacts.lock().expect("contact store lock");
        contacts.get(identity).cloned()
    }
}

/// Fixed identity key material.
#[derive(Clone)]
pub struct StaticIdentityStore {
    identity: Identity,
    secret_key: SecretKey,
}

impl StaticIdentityStore {
    pub fn new(identity: Identity, secret_key: SecretKey) -> Self {
        Self {
            identity,
            secret_key,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact {
            identity: self.identity.clone(),
            public_key: self.secret_key.public_key(),
        }
    }
}

impl IdentityStore for StaticIdentityStore {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

/// Queue collecting outbound envelopes for inspection; clones share the same buffer.
#[derive(Clone, Default)]
pub struct RecordingQueue {
    envelopes: Arc<Mutex<Vec<Envelope>>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all enqueued envelopes.
    pub fn drain(&self) -> Vec<Envelope> {
        let mut envelopes = self.envelopes.lock().expect("queue lock");
        std::mem::take(&mut *envelopes)
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageQueue for RecordingQueue {
    fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut envelopes = self
            .envelopes
            .lock()
            .map_err(|_| QueueError("lock poisoned".to_string()))?;
        envelopes.push(envelope);
        Ok(())
    }
}

/// Every notification the engine can emit, in recordable form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedEvent {
    NewSessionInitiated(SessionId),
    ResponderSessionEstablished {
        session_id: SessionId,
        preempted: bool,
    },
    InitiatorSessionEstablished(SessionId),
    RejectReceived {
        session_id: SessionId,
        cause: RejectCause,
        session_unknown: bool,
    },
    SessionNotFound(SessionId),
    SessionForMessageNotFound(SessionId),
    SessionBadState(SessionId),
    SessionTerminated(SessionId),
    MessagesSkipped {
        session_id: SessionId,
        num_skipped: u64,
    },
    MessageOutOfOrder(SessionId),
    MessageDecryptionFailed(SessionId),
    First4DhMessageReceived(SessionId),
    UnexpectedAppliedVersion(SessionId),
    NegotiatedVersionUpdated {
        session_id: SessionId,
        version: Version,
    },
    MessageWithoutFsReceived(SessionId),
    FeatureMaskUpdated,
}

/// Status listener recording every notification; clones share the same log.
#[derive(Clone)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    fs_support: Arc<AtomicBool>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            fs_support: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all recorded events.
    pub fn drain(&self) -> Vec<RecordedEvent> {
        let mut events = self.events.lock().expect("listener lock");
        std::mem::take(&mut *events)
    }

    pub fn contains(&self, event: &RecordedEvent) -> bool {
        self.events.lock().expect("listener lock").contains(event)
    }

    /// Simulates the contact's capability mask dropping forward-secrecy support.
    pub fn set_forward_secrecy_support(&self, support: bool) {
        self.fs_support.store(support, Ordering::SeqCst);
    }

    fn record(&self, event: RecordedEvent) {
        self.events.lock().expect("listener lock").push(event);
    }
}

impl StatusListener for RecordingListener {
    fn new_session_initiated(&self, session: &DhSession, _contact: &Contact) {
        self.record(RecordedEvent::NewSessionInitiated(session.id()));
    }

    fn responder_session_established(
        &self,
        session: &DhSession,
        _contact: &Contact,
        existing_session_preempted: bool,
    ) {
        self.record(RecordedEvent::ResponderSessionEstablished {
            session_id: session.id(),
            preempted: existing_session_preempted,
        });
    }

    fn initiator_session_established(&self, session: &DhSession, _contact: &Contact) {
        self.record(RecordedEvent::InitiatorSessionEstablished(session.id()));
    }

    fn reject_received(
        &self,
        session_id: SessionId,
        _rejected_message_id: MessageId,
        cause: RejectCause,
        _contact: &Contact,
        session_unknown: bool,
    ) {
        self.record(RecordedEvent::RejectReceived {
            session_id,
            cause,
            session_unknown,
        });
    }

    fn session_not_found(&self, session_id: SessionId, _contact: &Contact) {
        self.record(RecordedEvent::SessionNotFound(session_id));
    }

    fn session_for_message_not_found(
        &self,
        session_id: SessionId,
        _message_id: MessageId,
        _contact: &Contact,
    ) {
        self.record(RecordedEvent::SessionForMessageNotFound(session_id));
    }

    fn session_bad_state(&self, session_id: SessionId, _contact: &Contact) {
        self.record(RecordedEvent::SessionBadState(session_id));
    }

    fn session_terminated(&self, session_id: SessionId, _contact: &Contact) {
        self.record(RecordedEvent::SessionTerminated(session_id));
    }

    fn messages_skipped(&self, session_id: SessionId, _contact: &Contact, num_skipped: u64) {
        self.record(RecordedEvent::MessagesSkipped {
            session_id,
            num_skipped,
        });
    }

    fn message_out_of_order(
        &self,
        session_id: SessionId,
        _contact: &Contact,
        _message_id: MessageId,
    ) {
        self.record(RecordedEvent::MessageOutOfOrder(session_id));
    }

    fn message_decryption_failed(
        &self,
        session_id: SessionId,
        _contact: &Contact,
        _message_id: MessageId,
    ) {
        self.record(RecordedEvent::MessageDecryptionFailed(session_id));
    }

    fn first_4dh_message_received(&self, session: &DhSession, _contact: &Contact) {
        self.record(RecordedEvent::First4DhMessageReceived(session.id()));
    }

    fn unexpected_applied_version(
        &self,
        session: &DhSession,
        _applied_version: u16,
        _contact: &Contact,
    ) {
        self.record(RecordedEvent::UnexpectedAppliedVersion(session.id()));
    }

    fn negotiated_version_updated(
        &self,
        session: &DhSession,
        negotiated_version: Version,
        _contact: &Contact,
    ) {
        self.record(RecordedEvent::NegotiatedVersionUpdated {
            session_id: session.id(),
            version: negotiated_version,
        });
    }

    fn message_without_fs_received(&self, _contact: &Contact, session: &DhSession) {
        self.record(RecordedEvent::MessageWithoutFsReceived(session.id()));
    }

    fn has_forward_secrecy_support(&self, _contact: &Contact) -> bool {
        self.fs_support.load(Ordering::SeqCst)
    }

    fn update_feature_mask(&self, _contact: &Contact) {
        self.record(RecordedEvent::FeatureMaskUpdated);
    }
}

/// Failure listener recording rejected message ids; clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingFailureListener {
    rejected: Arc<Mutex<Vec<MessageId>>>,
}

impl RecordingFailureListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejected(&self) -> Vec<MessageId> {
        self.rejected.lock().expect("failure listener lock").clone()
    }
}

impl FailureListener for RecordingFailureListener {
    fn notify_reject_received(&self, _contact: &Contact, rejected_message_id: MessageId) {
        let mut rejected = self.rejected.lock().expect("failure listener lock");
        rejected.push(rejected_message_id);
    }
}
