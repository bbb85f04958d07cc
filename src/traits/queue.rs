// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::envelope::Envelope;

/// Outbound handover to the transport layer.
///
/// Enqueueing must be bounded and non-blocking; the engine calls this inside its critical
/// section and relies on delivery happening asynchronously elsewhere.
pub trait MessageQueue {
    fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError>;
}

#[derive(Debug, Error)]
#[error("could not enqueue envelope for delivery: {0}")]
pub struct QueueError(pub String);
