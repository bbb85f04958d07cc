// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::session::{DhSession, SessionId};
use crate::traits::Identity;

/// Durable storage of forward-secrecy sessions.
///
/// Every call must be atomic with respect to its own read-modify-write; the engine serializes
/// all store access behind its own lock, so implementations never see concurrent engine calls,
/// only whatever unrelated external access they choose to allow (which should be none).
pub trait SessionStore {
    /// Looks up one session by id.
    fn get_session(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
        session_id: &SessionId,
    ) -> Result<Option<DhSession>, SessionStoreError>;

    /// Returns the "best" session with a peer: the one with the lowest session id.
    fn best_session(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
    ) -> Result<Option<DhSession>, SessionStoreError>;

    /// Inserts or replaces a session.
    fn store_session(&self, session: &DhSession) -> Result<(), SessionStoreError>;

    /// Deletes one session, failing with [`SessionStoreError::NotFound`] when it does not exist.
    fn delete_session(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
        session_id: &SessionId,
    ) -> Result<(), SessionStoreError>;

    /// Deletes all sessions with a peer except the one with `keep_id`, returning how many were
    /// deleted. With `keep_two_dh` set, sessions still in 2DH-only mode are also spared.
    fn delete_all_except(
        &self,
        my_identity: &Identity,
        peer_identity: &Identity,
        keep_id: &SessionId,
        keep_two_dh: bool,
    ) -> Result<usize, SessionStoreError>;
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session {0} not found in store")]
    NotFound(SessionId),

    #[error("session store backend failure: {0}")]
    Backend(String),
}
