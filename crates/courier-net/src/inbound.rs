//! Hand-off queue between the read loop and the host application.
//!
//! The read loop pushes messages the host has to act on; the host drains at
//! most one per tick of its own update loop. Capacity is bounded: when the
//! host falls behind, new messages are refused and handed back to the
//! caller, which must then not acknowledge them to the server.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::messages::Message;

/// The queue was full; the rejected message is returned.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("inbound queue full ({capacity} messages)")]
pub struct InboundFull {
    /// Capacity of the queue that refused the message.
    pub capacity: usize,
    /// The message that was not queued.
    pub message: Message,
}

/// Bounded FIFO of inbound messages.
#[derive(Debug)]
pub struct InboundQueue {
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
}

impl InboundQueue {
    /// Create a queue holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    /// Append a message. Existing entries are never evicted.
    pub fn push(&self, message: Message) -> Result<(), InboundFull> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            return Err(InboundFull {
                capacity: self.capacity,
                message,
            });
        }
        queue.push_back(message);
        Ok(())
    }

    /// Take the oldest message.
    pub fn pop(&self) -> Option<Message> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Drop every queued message.
    pub fn clear(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
