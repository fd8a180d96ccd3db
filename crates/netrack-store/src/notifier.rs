//! Store change notification.
//!
//! Subscribers register with a [`ChangeNotifier`] and get a [`Subscription`]
//! handle. Every successful commit publishes a payload-free [`StoreChanged`]
//! signal; subscribers react by re-reading the whole record set, so a
//! coalesced or duplicated signal never leaves them with stale data.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::trace;

/// Signal that the record set changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChanged;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Sender<StoreChanged>>>,
}

/// Observer registry for store changes.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<Registry>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        // One slot: a pending signal already covers any later commit
        let (tx, rx) = bounded(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Signal every live subscriber. Never blocks.
    ///
    /// Returns the number of subscribers that were signalled.
    pub fn publish(&self) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let mut delivered = 0;
        subscribers.retain(|id, tx| match tx.try_send(StoreChanged) {
            Ok(()) | Err(TrySendError::Full(_)) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("Dropping disconnected subscriber {}", id);
                false
            }
        });

        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Handle to a change subscription. Dropping it deregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: Receiver<StoreChanged>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Block until the next change. `None` once the notifier is gone.
    pub fn recv(&self) -> Option<StoreChanged> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the next change.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StoreChanged> {
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take a pending change without waiting.
    pub fn try_recv(&self) -> Option<StoreChanged> {
        self.rx.try_recv().ok()
    }

    /// Underlying receiver, for use with `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<StoreChanged> {
        &self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}
