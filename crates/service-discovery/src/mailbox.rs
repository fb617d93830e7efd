//! Coalescing notification mailboxes
//!
//! Connection-state flips and children-change notifications are idempotent
//! "something changed, re-check" signals. A mailbox never queues more than
//! one pending value per key: posting replaces what is pending and wakes the
//! consumer through a one-slot channel, so a burst of notifications costs
//! O(1) work on the consumer side.

use indexmap::IndexSet;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coalesce {
    /// Keep only the most recent value
    Latest,
    /// Keep the most recent signal for every distinct value
    PerKey,
}

/// Bounded mailbox drained by a single consumer loop
pub(crate) struct Mailbox<T> {
    mode: Coalesce,
    pending: Mutex<IndexSet<T>>,
    wake_tx: async_channel::Sender<()>,
    wake_rx: async_channel::Receiver<()>,
}

impl<T: Hash + Eq> Mailbox<T> {
    /// Single-slot mailbox: a new post discards anything still pending
    pub(crate) fn latest() -> Self {
        Self::with_mode(Coalesce::Latest)
    }

    /// One slot per distinct value, delivered in first-posted order
    pub(crate) fn per_key() -> Self {
        Self::with_mode(Coalesce::PerKey)
    }

    fn with_mode(mode: Coalesce) -> Self {
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        Self {
            mode,
            pending: Mutex::new(IndexSet::new()),
            wake_tx,
            wake_rx,
        }
    }

    fn pending(&self) -> MutexGuard<'_, IndexSet<T>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post a value without blocking. Returns `false` once the mailbox is closed.
    pub(crate) fn post(&self, value: T) -> bool {
        if self.wake_tx.is_closed() {
            return false;
        }
        {
            let mut pending = self.pending();
            if self.mode == Coalesce::Latest {
                pending.clear();
            }
            pending.insert(value);
        }
        // A full wake slot already guarantees the consumer will look again
        let _ = self.wake_tx.try_send(());
        true
    }

    /// Wait for the next value. Returns `None` once closed and drained.
    pub(crate) async fn recv(&self) -> Option<T> {
        loop {
            if self.wake_rx.recv().await.is_err() {
                return self.pending().shift_remove_index(0);
            }
            let (next, more) = {
                let mut pending = self.pending();
                let next = pending.shift_remove_index(0);
                (next, !pending.is_empty())
            };
            if more {
                let _ = self.wake_tx.try_send(());
            }
            if next.is_some() {
                return next;
            }
        }
    }

    /// Stop accepting posts; the consumer drains what is pending, then sees `None`
    pub(crate) fn close(&self) {
        self.wake_tx.close();
    }

    /// Whether `close` was called
    pub(crate) fn is_closed(&self) -> bool {
        self.wake_tx.is_closed()
    }
}
