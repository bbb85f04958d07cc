// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios between two peers wired up with in-memory collaborators.
use crate::crypto::Rng;
use crate::crypto::x25519::SecretKey;
use crate::engine::{EngineError, ForwardSecurityEngine};
use crate::envelope::{
    Envelope, EnvelopeData, MessageData, MessageId, OutgoingMessage, PlainMessage, RejectCause,
    TerminateCause,
};
use crate::session::{DhSession, DhType, SessionId, SessionState};
use crate::test_utils::{
    MemoryContactStore, MemorySessionStore, RecordedEvent, RecordingFailureListener,
    RecordingListener, RecordingQueue, StaticIdentityStore,
};
use crate::traits::{Contact, Identity, SessionStore};
use crate::version::{SUPPORTED_VERSION_MIN, SUPPORTED_VERSION_RANGE, Version};

type TestEngine = ForwardSecurityEngine<
    MemorySessionStore,
    MemoryContactStore,
    StaticIdentityStore,
    RecordingQueue,
    RecordingFailureListener,
>;

struct TestPeer {
    engine: TestEngine,
    sessions: MemorySessionStore,
    contacts: MemoryContactStore,
    queue: RecordingQueue,
    listener: RecordingListener,
    failures: RecordingFailureListener,
    identity: Identity,
    contact: Contact,
    secret_key: SecretKey,
}

fn peer(name: &str, seed: u8) -> TestPeer {
    let rng = Rng::from_seed([seed; 32]);
    let secret_key = SecretKey::generate(&rng).unwrap();
    let identity = Identity::new(name);
    let identity_store = StaticIdentityStore::new(identity.clone(), secret_key.clone());
    let contact = identity_store.contact();

    let sessions = MemorySessionStore::new();
    let contacts = MemoryContactStore::new();
    let queue = RecordingQueue::new();
    let failures = RecordingFailureListener::new();
    let listener = RecordingListener::new();

    let mut engine = ForwardSecurityEngine::new(
        sessions.clone(),
        contacts.clone(),
        identity_store,
        queue.clone(),
        failures.clone(),
        rng,
    );
    engine.set_status_listener(Box::new(listener.clone()));

    TestPeer {
        engine,
        sessions,
        contacts,
        queue,
        listener,
        failures,
        identity,
        contact,
        secret_key,
    }
}

fn outgoing(to: &Identity, seq: u8, body: &[u8]) -> OutgoingMessage {
    OutgoingMessage {
        to_identity: to.clone(),
        message_id: MessageId::from_bytes([seq; 8]),
        created_at: 1_700_000_000_000,
        flags: 0,
        message_type: 0x01,
        body: body.to_vec(),
        required_version: Some(Version::V1_0),
    }
}

/// Drains a peer's outbound queue, expecting exactly one envelope.
fn single_envelope(queue: &RecordingQueue) -> Envelope {
    let mut envelopes = queue.drain();
    assert_eq!(envelopes.len(), 1, "expected exactly one envelope");
    envelopes.remove(0)
}

/// Establishes a 4DH session between two fresh peers and returns the session id.
///
/// Alice initiates with a first 2DH message which Bob receives, then Alice processes Bob's
/// Accept.
fn establish(alice: &TestPeer, bob: &TestPeer) -> SessionId {
    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hello"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let session_id = init.data.session_id();

    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    let accept = single_envelope(&bob.queue);
    assert!(matches!(accept.data, EnvelopeData::Accept { .. }));

    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &message)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"hello");

    alice.engine.process_envelope(&bob.contact, &accept).unwrap();

    alice.listener.drain();
    bob.listener.drain();
    session_id
}

#[test]
fn two_dh_round_trip() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"first contact"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let EnvelopeData::Init { session_id, version_range, .. } = init.data else {
        panic!("expected init envelope");
    };
    assert_eq!(version_range, SUPPORTED_VERSION_RANGE);
    assert!(
        alice
            .listener
            .contains(&RecordedEvent::NewSessionInitiated(session_id))
    );

    // The first message goes out in 2DH mode at counter 1.
    let EnvelopeData::Message(ref data) = message.data else {
        panic!("expected message envelope");
    };
    assert_eq!(data.dh_type, DhType::TwoDh);
    assert_eq!(data.counter, 1);
    assert_eq!(data.session_id, session_id);

    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    assert!(bob.listener.contains(&RecordedEvent::ResponderSessionEstablished {
        session_id,
        preempted: false,
    }));
    let accept = single_envelope(&bob.queue);
    assert!(matches!(accept.data, EnvelopeData::Accept { .. }));

    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &message)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"first contact");
    assert_eq!(decrypted.message_type, 0x01);
    assert_eq!(decrypted.mode, DhType::TwoDh);
    assert_eq!(decrypted.from_identity, alice.identity);
    assert_eq!(decrypted.message_id, MessageId::from_bytes([1; 8]));
}

#[test]
fn four_dh_round_trip_in_both_directions() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);
    let session_id = establish(&alice, &bob);

    // Alice's session reached 4DH with the negotiated maximum version.
    let session = alice
        .sessions
        .get_session(&alice.identity, &bob.identity, &session_id)
        .unwrap()
        .unwrap();
    assert_eq!(session.state().unwrap(), SessionState::Established);
    assert_eq!(session.negotiated_version(), Version::V1_1);

    // Alice to Bob, now in 4DH mode.
    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 2, b"upgraded"))
        .unwrap();
    let EnvelopeData::Message(ref data) = message.data else {
        panic!("expected message envelope");
    };
    assert_eq!(data.dh_type, DhType::FourDh);
    assert_eq!(data.counter, 1);

    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &message)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"upgraded");
    assert_eq!(decrypted.mode, DhType::FourDh);
    assert!(
        bob.listener
            .contains(&RecordedEvent::First4DhMessageReceived(session_id))
    );

    // Bob's 2DH receive chain is gone for good now.
    let session = bob
        .sessions
        .get_session(&bob.identity, &alice.identity, &session_id)
        .unwrap()
        .unwrap();
    assert!(session.peer_ratchet_2dh().is_none());
    assert_eq!(session.state().unwrap(), SessionState::Established);

    // Bob to Alice.
    let reply = bob
        .engine
        .make_message(&alice.contact, &outgoing(&alice.identity, 3, b"right back"))
        .unwrap();
    let decrypted = alice
        .engine
        .process_envelope(&bob.contact, &reply)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"right back");
    assert_eq!(decrypted.mode, DhType::FourDh);
    assert_eq!(decrypted.applied_version, Version::V1_1);
}

#[test]
fn init_is_idempotent() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hi"))
        .unwrap();
    let init = single_envelope(&alice.queue);

    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    let accept = single_envelope(&bob.queue);
    assert!(matches!(accept.data, EnvelopeData::Accept { .. }));
    bob.listener.drain();

    // Retry of the same Init: no state change, no second Accept.
    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    assert!(bob.queue.is_empty());
    assert!(bob.listener.drain().is_empty());
    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 1);
}

#[test]
fn stray_accept_answers_with_terminate() {
    let rng = Rng::from_seed([9; 32]);
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let session_id = SessionId::from_bytes([7; 16]);
    let accept = Envelope {
        to_identity: bob.identity.clone(),
        message_id: MessageId::from_bytes([9; 8]),
        created_at: 0,
        flags: 0,
        data: EnvelopeData::Accept {
            session_id,
            version_range: SUPPORTED_VERSION_RANGE,
            ephemeral_public_key: SecretKey::generate(&rng).unwrap().public_key(),
        },
    };

    bob.engine.process_envelope(&alice.contact, &accept).unwrap();

    let terminate = single_envelope(&bob.queue);
    assert_eq!(
        terminate.data,
        EnvelopeData::Terminate {
            session_id,
            cause: TerminateCause::UnknownSession,
        }
    );
    assert!(
        bob.listener
            .contains(&RecordedEvent::SessionNotFound(session_id))
    );
    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 0);
}

#[test]
fn first_4dh_message_prunes_superseded_sessions() {
    let rng = Rng::from_seed([9; 32]);
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hello"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let session_id = init.data.session_id();

    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    let accept = single_envelope(&bob.queue);
    bob.engine.process_envelope(&alice.contact, &message).unwrap();
    alice.engine.process_envelope(&bob.contact, &accept).unwrap();

    // A leftover session with a higher id; the established one stays the "best".
    let stale = DhSession::respond(
        SessionId::from_bytes([0xff; 16]),
        bob.identity.clone(),
        &bob.secret_key,
        &alice.contact,
        SUPPORTED_VERSION_RANGE,
        SecretKey::generate(&rng).unwrap().public_key(),
        &rng,
    )
    .unwrap();
    bob.sessions.store_session(&stale).unwrap();
    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 2);

    // First 4DH message from Alice prunes everything but the best session.
    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 2, b"upgraded"))
        .unwrap();
    bob.engine.process_envelope(&alice.contact, &message).unwrap();

    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 1);
    assert!(
        bob.sessions
            .get_session(&bob.identity, &alice.identity, &session_id)
            .unwrap()
            .is_some()
    );
}

#[test]
fn init_race_keeps_own_two_dh_session() {
    let rng = Rng::from_seed([9; 32]);
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    // Bob already answered one Init from Alice.
    alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hi"))
        .unwrap();
    let first_init = single_envelope(&alice.queue);
    bob.engine.process_envelope(&alice.contact, &first_init).unwrap();
    bob.queue.drain();
    bob.listener.drain();

    // Bob also initiated a 2DH-only session towards Alice himself (Init race).
    let own = DhSession::initiate(bob.identity.clone(), &alice.contact, &rng).unwrap();
    let own_id = own.id();
    bob.sessions.store_session(&own).unwrap();

    // Alice lost her data and initiates from scratch.
    let second_init = Envelope {
        to_identity: bob.identity.clone(),
        message_id: MessageId::from_bytes([9; 8]),
        created_at: 0,
        flags: 0,
        data: EnvelopeData::Init {
            session_id: SessionId::from_bytes([9; 16]),
            version_range: SUPPORTED_VERSION_RANGE,
            ephemeral_public_key: SecretKey::generate(&rng).unwrap().public_key(),
        },
    };
    bob.engine
        .process_envelope(&alice.contact, &second_init)
        .unwrap();

    // The stale responder session was preempted, Bob's own 2DH session survived.
    assert!(bob.listener.contains(&RecordedEvent::ResponderSessionEstablished {
        session_id: SessionId::from_bytes([9; 16]),
        preempted: true,
    }));
    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 2);
    assert!(
        bob.sessions
            .get_session(&bob.identity, &alice.identity, &own_id)
            .unwrap()
            .is_some()
    );
}

#[test]
fn message_type_requiring_newer_version_fails_on_fresh_session() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let mut message = outgoing(&bob.identity, 1, b"needs 1.1");
    message.required_version = Some(Version::V1_1);

    let result = alice.engine.make_message(&bob.contact, &message);
    let Err(EngineError::MessageTypeNotSupported {
        required,
        negotiated,
    }) = result
    else {
        panic!("expected message type not supported error");
    };
    assert_eq!(required, Some(Version::V1_1));
    assert_eq!(negotiated, SUPPORTED_VERSION_MIN);

    // The fresh session and its Init survive the failed version check.
    let init = single_envelope(&alice.queue);
    assert!(matches!(init.data, EnvelopeData::Init { .. }));
    assert_eq!(alice.sessions.count(&alice.identity, &bob.identity), 1);

    // Once the session is gone in 4DH with version 1.1 the same message goes through.
    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    let accept = single_envelope(&bob.queue);
    alice.engine.process_envelope(&bob.contact, &accept).unwrap();
    let envelope = alice.engine.make_message(&bob.contact, &message).unwrap();
    assert!(matches!(envelope.data, EnvelopeData::Message(_)));
}

#[test]
fn never_sendable_message_type_is_refused() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let mut message = outgoing(&bob.identity, 1, b"no fs for this type");
    message.required_version = None;

    let result = alice.engine.make_message(&bob.contact, &message);
    assert!(matches!(
        result,
        Err(EngineError::MessageTypeNotSupported {
            required: None,
            ..
        })
    ));
}

#[test]
fn skipped_messages_turn_the_ratchet_forward() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let message_1 = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"one"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let session_id = init.data.session_id();
    let message_2 = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 2, b"two"))
        .unwrap();

    bob.engine.process_envelope(&alice.contact, &init).unwrap();
    bob.queue.drain();

    // Message two arrives first; the ratchet turns past the lost counter.
    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &message_2)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"two");
    assert!(bob.listener.contains(&RecordedEvent::MessagesSkipped {
        session_id,
        num_skipped: 1,
    }));

    // Message one is late now; its key is gone for good.
    let result = bob.engine.process_envelope(&alice.contact, &message_1);
    assert!(matches!(result, Err(EngineError::OutOfOrder(_))));
    assert!(
        bob.listener
            .contains(&RecordedEvent::MessageOutOfOrder(session_id))
    );

    // The session itself is untouched and continues to work.
    let message_3 = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 3, b"three"))
        .unwrap();
    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &message_3)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"three");
}

#[test]
fn message_for_unknown_session_is_rejected_and_session_torn_down() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hello"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let session_id = init.data.session_id();

    // Bob never saw the Init.
    let result = bob
        .engine
        .process_envelope(&alice.contact, &message)
        .unwrap();
    assert!(result.is_none());
    let reject = single_envelope(&bob.queue);
    assert_eq!(
        reject.data,
        EnvelopeData::Reject {
            session_id,
            rejected_message_id: MessageId::from_bytes([1; 8]),
            cause: RejectCause::UnknownSession,
        }
    );
    assert!(
        bob.listener
            .contains(&RecordedEvent::SessionForMessageNotFound(session_id))
    );

    // Alice processes the reject: her session is dropped, the failure collaborator learns the
    // message id for re-queueing.
    alice.engine.process_envelope(&bob.contact, &reject).unwrap();
    assert_eq!(alice.sessions.count(&alice.identity, &bob.identity), 0);
    assert!(alice.listener.contains(&RecordedEvent::RejectReceived {
        session_id,
        cause: RejectCause::UnknownSession,
        session_unknown: false,
    }));
    assert!(alice.listener.contains(&RecordedEvent::FeatureMaskUpdated));
    assert_eq!(alice.failures.rejected(), vec![MessageId::from_bytes([1; 8])]);
}

#[test]
fn tampered_ciphertext_is_rejected_without_losing_the_session() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);
    let session_id = establish(&alice, &bob);

    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 2, b"genuine"))
        .unwrap();

    let mut tampered = message.clone();
    let EnvelopeData::Message(ref mut data) = tampered.data else {
        panic!("expected message envelope");
    };
    data.ciphertext[0] ^= 1;

    let result = bob
        .engine
        .process_envelope(&alice.contact, &tampered)
        .unwrap();
    assert!(result.is_none());
    let reject = single_envelope(&bob.queue);
    assert!(matches!(
        reject.data,
        EnvelopeData::Reject {
            cause: RejectCause::StateMismatch,
            ..
        }
    ));
    assert!(
        bob.listener
            .contains(&RecordedEvent::MessageDecryptionFailed(session_id))
    );

    // Nothing was persisted for the failed attempt; the genuine envelope still decrypts.
    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &message)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"genuine");
}

#[test]
fn four_dh_claim_without_completed_handshake_is_state_mismatch() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hi"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let session_id = init.data.session_id();

    // Bob claims 4DH although Alice (initiator) never processed an Accept.
    let bogus = Envelope {
        to_identity: alice.identity.clone(),
        message_id: MessageId::from_bytes([9; 8]),
        created_at: 0,
        flags: 0,
        data: EnvelopeData::Message(MessageData {
            session_id,
            dh_type: DhType::FourDh,
            counter: 1,
            applied_version: Version::V1_0.to_u16(),
            ciphertext: vec![0; 32],
        }),
    };

    let result = alice
        .engine
        .process_envelope(&bob.contact, &bogus)
        .unwrap();
    assert!(result.is_none());
    let reject = single_envelope(&alice.queue);
    assert!(matches!(
        reject.data,
        EnvelopeData::Reject {
            cause: RejectCause::StateMismatch,
            ..
        }
    ));
    assert!(
        alice
            .listener
            .contains(&RecordedEvent::SessionBadState(session_id))
    );
}

#[test]
fn unknown_applied_version_degrades_and_still_decrypts() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);
    establish(&alice, &bob);

    let message = alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 2, b"hello"))
        .unwrap();
    let mut future_version = message.clone();
    let EnvelopeData::Message(ref mut data) = future_version.data else {
        panic!("expected message envelope");
    };
    // A sender far ahead of us; the unknown version degrades to 1.0 and still matches our major.
    data.applied_version = 0x0a00;

    let decrypted = bob
        .engine
        .process_envelope(&alice.contact, &future_version)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.body, b"hello");
    assert_eq!(decrypted.applied_version, Version::V1_1);
}

#[test]
fn terminate_clears_sessions_on_both_sides() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);
    let session_id = establish(&alice, &bob);

    alice
        .engine
        .clear_and_terminate_all_sessions(&bob.contact, TerminateCause::Reset)
        .unwrap();
    assert_eq!(alice.sessions.count(&alice.identity, &bob.identity), 0);

    let terminate = single_envelope(&alice.queue);
    assert_eq!(
        terminate.data,
        EnvelopeData::Terminate {
            session_id,
            cause: TerminateCause::Reset,
        }
    );

    bob.engine
        .process_envelope(&alice.contact, &terminate)
        .unwrap();
    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 0);
    assert!(
        bob.listener
            .contains(&RecordedEvent::SessionTerminated(session_id))
    );
    assert!(bob.listener.contains(&RecordedEvent::FeatureMaskUpdated));

    // A terminate for an already-gone session is tolerated.
    bob.engine
        .process_envelope(&alice.contact, &terminate)
        .unwrap();
}

#[test]
fn init_from_capability_negative_peer_is_terminated() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);

    alice
        .engine
        .make_message(&bob.contact, &outgoing(&bob.identity, 1, b"hi"))
        .unwrap();
    let init = single_envelope(&alice.queue);
    let session_id = init.data.session_id();

    // Bob's directory says Alice cannot do forward secrecy (stale or downgraded mask).
    bob.listener.set_forward_secrecy_support(false);
    bob.engine.process_envelope(&alice.contact, &init).unwrap();

    // No Accept; the just-created session is torn down again with a Terminate.
    let terminate = single_envelope(&bob.queue);
    assert_eq!(
        terminate.data,
        EnvelopeData::Terminate {
            session_id,
            cause: TerminateCause::DisabledByRemote,
        }
    );
    assert_eq!(bob.sessions.count(&bob.identity, &alice.identity), 0);
    assert!(bob.listener.contains(&RecordedEvent::FeatureMaskUpdated));
}

#[test]
fn plain_message_triggers_downgrade_warning() {
    let alice = peer("ALICE", 1);
    let bob = peer("BOB", 2);
    let session_id = establish(&alice, &bob);
    alice.contacts.insert(bob.contact.clone());

    // A plain message of a type the established session could have protected.
    alice
        .engine
        .warn_if_message_without_forward_security_received(&PlainMessage {
            from_identity: bob.identity.clone(),
            required_version: Some(Version::V1_0),
        });
    assert!(alice.listener.contains(&RecordedEvent::FeatureMaskUpdated));
    assert!(
        alice
            .listener
            .contains(&RecordedEvent::MessageWithoutFsReceived(session_id))
    );
    alice.listener.drain();

    // Message types outside of forward security never warn.
    alice
        .engine
        .warn_if_message_without_forward_security_received(&PlainMessage {
            from_identity: bob.identity.clone(),
            required_version: None,
        });
    assert!(alice.listener.drain().is_empty());

    // A peer whose mask already dropped forward secrecy gets the downgrade status elsewhere.
    alice.listener.set_forward_secrecy_support(false);
    alice
        .engine
        .warn_if_message_without_forward_security_received(&PlainMessage {
            from_identity: bob.identity.clone(),
            required_version: Some(Version::V1_0),
        });
    assert!(alice.listener.drain().is_empty());
}
