//! Lease inventory: messages received and not yet acked or nacked.
//!
//! Uses DashMap so the callback pool can release entries without contending
//! with the lease renewal task. The inventory also carries flow control:
//! it is full once either the message or the byte limit is reached, and
//! [`Inventory::wait_for_capacity`] parks the receiver until it drains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Lease {
    since: Instant,
    bytes: usize,
}

#[derive(Debug)]
pub struct Inventory {
    /// Ack id → lease start and accounted size.
    leases: DashMap<String, Lease>,
    bytes: AtomicUsize,
    max_messages: usize,
    max_bytes: usize,
    released: Notify,
}

impl Inventory {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            leases: DashMap::new(),
            bytes: AtomicUsize::new(0),
            max_messages: max_messages.max(1),
            max_bytes: max_bytes.max(1),
            released: Notify::new(),
        }
    }

    /// Starts tracking `ack_id`. Re-adding a held id keeps its original lease.
    pub fn add(&self, ack_id: &str, bytes: usize) {
        let mut inserted = false;
        self.leases.entry(ack_id.to_owned()).or_insert_with(|| {
            inserted = true;
            Lease {
                since: Instant::now(),
                bytes,
            }
        });
        if inserted {
            self.bytes.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Returns `true` if the id was held.
    pub fn remove(&self, ack_id: &str) -> bool {
        match self.leases.remove(ack_id) {
            Some((_, lease)) => {
                self.release_bytes(lease.bytes);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Accounted size of everything held.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_messages || self.bytes() >= self.max_bytes
    }

    /// Resolves once the inventory is below both limits.
    pub async fn wait_for_capacity(&self) {
        loop {
            let released = self.released.notified();
            if !self.is_full() {
                return;
            }
            released.await;
        }
    }

    /// Ids whose lease should be extended. Entries held longer than
    /// `max_total` are dropped and no longer renewed.
    pub fn renewable(&self, max_total: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = 0;
        self.leases.retain(|_, lease| {
            let keep = now.saturating_duration_since(lease.since) < max_total;
            if !keep {
                expired += lease.bytes;
            }
            keep
        });
        if expired > 0 {
            self.release_bytes(expired);
        }
        self.leases.iter().map(|e| e.key().clone()).collect()
    }

    /// Empties the inventory, returning everything that was held.
    pub fn drain(&self) -> Vec<String> {
        let ids: Vec<String> = self.leases.iter().map(|e| e.key().clone()).collect();
        ids.into_iter().filter(|id| self.remove(id)).collect()
    }

    fn release_bytes(&self, bytes: usize) {
        self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.released.notify_waiters();
    }
}
