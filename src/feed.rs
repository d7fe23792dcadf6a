//! Push-based transaction change feed.
//!
//! Replaces the hosted realtime channel with an explicit observer registry:
//! a subscription returns a handle that unregisters itself on drop, and
//! events are delivered through an unbounded channel so publishers never
//! block on slow consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::models::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEventKind {
    /// A new ledger row was recorded locally.
    Recorded,
    /// An existing row's status changed (verified/reversed/disputed).
    StatusChanged,
    /// A queued row landed on the cloud mirror.
    Synced,
}

#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub kind: FeedEventKind,
    pub business_id: String,
    pub transaction: Transaction,
}

struct Listener {
    business_id: String,
    sender: UnboundedSender<TransactionEvent>,
}

type Registry = Arc<Mutex<HashMap<u64, Listener>>>;

/// Observer registry scoped by tenant.
#[derive(Default)]
pub struct TransactionFeed {
    listeners: Registry,
    next_id: AtomicU64,
}

impl TransactionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one tenant's transactions. The returned
    /// subscription unregisters itself when dropped.
    pub fn subscribe(&self, business_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(
                id,
                Listener {
                    business_id: business_id.to_string(),
                    sender: tx,
                },
            );
        }
        debug!(listener = id, business_id, "transaction feed subscription added");
        Subscription {
            id,
            registry: Arc::clone(&self.listeners),
            receiver: rx,
        }
    }

    /// Deliver an event to every listener registered for its tenant.
    /// Listeners whose receiver is gone are pruned.
    pub fn publish(&self, event: TransactionEvent) {
        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        listeners.retain(|_, listener| {
            if listener.business_id != event.business_id {
                return true;
            }
            listener.sender.send(event.clone()).is_ok()
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Live feed handle. Dropping it cancels the subscription.
pub struct Subscription {
    id: u64,
    registry: Registry,
    receiver: UnboundedReceiver<TransactionEvent>,
}

impl Subscription {
    /// Await the next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<TransactionEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll, mainly for tests and tick-driven consumers.
    pub fn try_recv(&mut self) -> Option<TransactionEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.registry.lock() {
            listeners.remove(&self.id);
        }
        debug!(listener = self.id, "transaction feed subscription removed");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
