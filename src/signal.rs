//! Process-wide task signals.
//!
//! The signal channel decouples "a command is running somewhere" from the
//! direct call path: any UI instance, including one created after the
//! command was dispatched elsewhere, reacts to the same two payload-less
//! signals. `task-started` makes a registered client attempt to bind;
//! `task-stopped` makes it dismiss its progress surface and unbind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The two signal kinds carried by the channel. No payload beyond the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    TaskStarted,
    TaskStopped,
}

impl Signal {
    /// The signal's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::TaskStarted => "task-started",
            Signal::TaskStopped => "task-stopped",
        }
    }
}

/// Handle returned by [`SignalHub::subscribe`]; pass it back to
/// [`SignalHub::unsubscribe`] when the observer goes away.
#[derive(Debug)]
pub struct SignalSubscription {
    id: u64,
}

/// Publish/subscribe hub for [`Signal`]s.
///
/// One hub normally serves the whole process ([`SignalHub::global`]), but
/// hubs are plain values so tests and multi-tenant embeddings can run their
/// own. Publishing walks the subscriber table and drops entries whose
/// receiver side is gone; explicit unsubscription remains the contract for
/// well-behaved observers.
#[derive(Debug, Default)]
pub struct SignalHub {
    subscribers: Mutex<HashMap<u64, UnboundedSender<Signal>>>,
    next_id: AtomicU64,
}

static GLOBAL_HUB: OnceLock<SignalHub> = OnceLock::new();

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide hub.
    pub fn global() -> &'static SignalHub {
        GLOBAL_HUB.get_or_init(SignalHub::new)
    }

    /// Register an observer. Signals published after this call are delivered
    /// to the returned receiver until the subscription is removed.
    pub fn subscribe(&self) -> (SignalSubscription, UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table().insert(id, tx);
        (SignalSubscription { id }, rx)
    }

    /// Remove an observer.
    ///
    /// Removing a subscription that is not registered (never was, or was
    /// already pruned) is expected during teardown races and is ignored.
    pub fn unsubscribe(&self, subscription: SignalSubscription) {
        if self.table().remove(&subscription.id).is_none() {
            tracing::debug!(id = subscription.id, "signal subscription already removed");
        }
    }

    /// Deliver a signal to every live subscriber.
    pub fn publish(&self, signal: Signal) {
        self.table().retain(|_, tx| tx.send(signal).is_ok());
    }

    /// Number of live subscriptions, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, UnboundedSender<Signal>>> {
        // A poisoned table only means a panicking publisher; the map itself
        // is still coherent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
