//! Inbound message queue.
//!
//! Unbounded FIFO with any number of producers (one reader task per inbound
//! connection) and a single consumer (the owning machine's event loop).
//! Enqueue never blocks and never drops while the consumer exists.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("message queue consumer has been dropped")]
pub struct QueueClosed;

/// A dequeued message with its position in the local arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: Message,
    /// 0 for the first message this queue ever delivered, then 1, 2, ...
    pub arrival: u64,
}

#[derive(Debug)]
pub struct MessageQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    delivered: u64,
}

/// Enqueue-only handle given to reader tasks.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: Sender<Message>,
}

impl MessageQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx, delivered: 0 }
    }

    pub fn producer(&self) -> QueueProducer {
        QueueProducer { tx: self.tx.clone() }
    }

    pub fn enqueue(&self, message: Message) {
        // The queue holds its own receiver, so this send cannot fail.
        let _ = self.tx.send(message);
    }

    /// Oldest pending message, or `None` without blocking.
    pub fn dequeue_if_any(&mut self) -> Option<QueuedMessage> {
        match self.rx.try_recv() {
            Ok(message) => {
                let queued = QueuedMessage { message, arrival: self.delivered };
                self.delivered += 1;
                Some(queued)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Pending count. May lag concurrent producers by a message or two.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Messages handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueProducer {
    pub fn enqueue(&self, message: Message) -> Result<(), QueueClosed> {
        self.tx.send(message).map_err(|_| QueueClosed)
    }
}
