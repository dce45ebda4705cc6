//! Fire-and-forget messages to external workers.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detection::{Category, RepresentationRef};
use crate::track::TrackId;

/// Message for a worker outside the real-time path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    /// Build or refresh the 3D representation of a newly confirmed track.
    ReconstructionRequest {
        track_id: TrackId,
        category: Category,
        representation: RepresentationRef,
        tick: u64,
    },
}

/// Bounded queue that never blocks the producer.
///
/// A full queue drops the message. Consumers take a [`Receiver`] from
/// [`OutboundQueue::receiver`].
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: Sender<OutboundMessage>,
    receiver: Receiver<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Enqueue without blocking. Returns whether the message was accepted.
    pub fn publish(&self, message: OutboundMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                debug!(?message, "outbound queue full, dropping message");
                false
            }
            Err(TrySendError::Disconnected(message)) => {
                debug!(?message, "outbound queue disconnected, dropping message");
                false
            }
        }
    }

    pub fn receiver(&self) -> Receiver<OutboundMessage> {
        self.receiver.clone()
    }

    /// Take every queued message.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}
