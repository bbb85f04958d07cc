// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts of the collaborators around the protocol engine: session persistence, identity and
//! contact lookup, the outbound transport queue and the event sink towards the application.
mod contacts;
mod listener;
mod queue;
mod store;

pub use contacts::{Contact, ContactStore, Identity, IdentityStore};
pub use listener::{FailureListener, StatusListener};
pub use queue::{MessageQueue, QueueError};
pub use store::{SessionStore, SessionStoreError};
