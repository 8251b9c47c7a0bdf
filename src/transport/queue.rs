use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

use super::{OutboundMessage, TransportError};

/// Bounded multi-producer, single-consumer queue of outbound messages.
///
/// `push` waits for a free slot when the queue is full; nothing is ever
/// dropped here. Only `discard_all` removes messages without delivering them.
#[derive(Debug)]
pub struct MessageQueue {
    items: Mutex<VecDeque<OutboundMessage>>,
    slots: Semaphore,
    available: Notify,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            items: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(capacity),
            available: Notify::new(),
            capacity,
        }
    }

    /// Append a message, waiting for space if the queue is full.
    pub async fn push(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;
        // Returned with `add_permits` when the message leaves the queue.
        permit.forget();

        self.items.lock().push_back(msg);
        self.available.notify_one();
        Ok(())
    }

    /// Append a message without waiting. Fails with `QueueFull` when every
    /// slot is taken.
    pub fn try_push(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        let permit = self.slots.try_acquire().map_err(|e| match e {
            TryAcquireError::Closed => TransportError::Closed,
            TryAcquireError::NoPermits => TransportError::QueueFull,
        })?;
        permit.forget();

        self.items.lock().push_back(msg);
        self.available.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<OutboundMessage> {
        let msg = self.items.lock().pop_front()?;
        self.slots.add_permits(1);
        Some(msg)
    }

    /// Wait up to `timeout` for a message.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<OutboundMessage> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Drop every queued message, returning how many were dropped.
    pub fn discard_all(&self) -> usize {
        let dropped = {
            let mut items = self.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        if dropped > 0 {
            self.slots.add_permits(dropped);
        }
        dropped
    }

    /// Fail all current and future `push` calls with `TransportError::Closed`.
    pub fn close(&self) {
        self.slots.close();
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
