//! Per-ordering-key sequential delivery.
//!
//! Messages sharing an ordering key are handed to the delivery callback one
//! at a time, in the order they were added. The next message for a key is
//! only released once [`Sequencer::next`] is called for the one in flight.
//! Messages with an empty key bypass the queues entirely.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::trace;

use crate::core::error::SequencerError;
use crate::core::message::Sequenced;

/// Delivery callback invoked for each released message.
pub type DeliverFn<M> = Arc<dyn Fn(M) + Send + Sync>;

pub struct Sequencer<M> {
    /// Ordering key → pending messages; the head is the one in flight.
    queues: Mutex<HashMap<String, VecDeque<M>>>,
    /// Threads currently inside the delivery callback, with the deliveries
    /// they triggered re-entrantly. Drained in a loop instead of recursing.
    delivering: Mutex<HashMap<ThreadId, VecDeque<M>>>,
    deliver: DeliverFn<M>,
}

/// Unregisters the current thread from `delivering`, even on unwind.
struct DeliveryGuard<'a, M> {
    delivering: &'a Mutex<HashMap<ThreadId, VecDeque<M>>>,
    thread: ThreadId,
}

impl<M> Drop for DeliveryGuard<'_, M> {
    fn drop(&mut self) {
        self.delivering.lock().remove(&self.thread);
    }
}

impl<M> fmt::Debug for Sequencer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("keys", &self.queues.lock().len())
            .finish()
    }
}

impl<M> Sequencer<M>
where
    M: Sequenced + Clone,
{
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Self {
            queues: Mutex::new(HashMap::new()),
            delivering: Mutex::new(HashMap::new()),
            deliver: Arc::new(deliver),
        }
    }

    /// Adds a message, delivering it immediately if nothing is in flight for
    /// its key.
    pub fn add(&self, message: M) {
        if message.ordering_key().is_empty() {
            self.dispatch(message);
            return;
        }

        // Enqueue and decide under one lock so two concurrent adds can't both
        // see themselves as first.
        let deliver_now = {
            let mut queues = self.queues.lock();
            let queue = queues
                .entry(message.ordering_key().to_owned())
                .or_default();
            queue.push_back(message.clone());
            queue.len() == 1
        };

        if deliver_now {
            self.dispatch(message);
        } else {
            trace!(
                ordering_key = message.ordering_key(),
                ack_id = message.ack_id(),
                "message queued behind in-flight delivery"
            );
        }
    }

    /// Marks `message` as done and releases the next message for its key.
    ///
    /// `message` must be the one currently in flight for its key; anything
    /// else is a contract violation and leaves the queue untouched.
    pub fn next(&self, message: &M) -> Result<(), SequencerError> {
        let key = message.ordering_key();
        if key.is_empty() {
            return Ok(());
        }

        let released = {
            let mut queues = self.queues.lock();
            let queue = match queues.get_mut(key) {
                Some(q) if q.front().map(|m| m.ack_id()) == Some(message.ack_id()) => q,
                _ => {
                    return Err(SequencerError::OutOfOrder {
                        ordering_key: key.to_owned(),
                        ack_id: message.ack_id().to_owned(),
                    })
                }
            };

            queue.pop_front();
            let head = queue.front().cloned();
            if head.is_none() {
                queues.remove(key);
            }
            head
        };

        if let Some(head) = released {
            self.dispatch(head);
        }
        Ok(())
    }

    /// Runs the delivery callback. A delivery triggered from inside the
    /// callback on the same thread is queued and run after it returns.
    fn dispatch(&self, message: M) {
        let thread = thread::current().id();
        {
            let mut delivering = self.delivering.lock();
            if let Some(deferred) = delivering.get_mut(&thread) {
                deferred.push_back(message);
                return;
            }
            delivering.insert(thread, VecDeque::new());
        }
        let _guard = DeliveryGuard {
            delivering: &self.delivering,
            thread,
        };

        let mut current = Some(message);
        while let Some(message) = current {
            (self.deliver)(message);
            current = self
                .delivering
                .lock()
                .get_mut(&thread)
                .and_then(VecDeque::pop_front);
        }
    }

    /// Number of ordering keys with pending or in-flight messages.
    pub fn key_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Messages tracked for `key`, including the one in flight.
    pub fn pending(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
