//! The worker interface boundary.
//!
//! The worker, the background process that actually executes commands
//! against the store, is reached through two traits. [`WorkerTransport`]
//! covers the fire-and-forget paths: asynchronous binding and command
//! delivery. [`WorkerHandle`] is the bound surface: symmetric listener
//! registration, the reconciliation queries, and the conflict resync
//! request. Events cross back to the UI thread over tokio unbounded
//! channels, drained by [`crate::client::TaskClient::pump`].
//!
//! ## Components
//!
//! - [`protocol`]: wire contract for out-of-process workers (framing,
//!   request and notification types)
//! - [`remote`]: `WorkerTransport` over a Unix domain socket (unix only)

pub mod protocol;
#[cfg(unix)]
pub mod remote;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::command::{Command, CommandId};
use crate::error::{Result, StrongroomError};
use crate::model::{ActionResult, ConflictSnapshot, TextRef};

#[cfg(unix)]
pub use remote::RemoteTransport;

/// Progress-listener callbacks, as data.
///
/// Ordering per command is started → updates* → stopped; clients must not
/// assume events arrive before the corresponding `task-started` signal and
/// reconcile on bind instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ActionEvent {
    Started {
        title: Option<TextRef>,
        message: Option<TextRef>,
        warning: Option<TextRef>,
    },
    Updated {
        title: Option<TextRef>,
        message: Option<TextRef>,
        warning: Option<TextRef>,
    },
    Stopped {
        command: CommandId,
        result: ActionResult,
    },
}

/// Sender half for progress events.
pub type ActionSender = UnboundedSender<ActionEvent>;
/// Sender half for store-change notifications.
pub type StoreSender = UnboundedSender<ConflictSnapshot>;
/// Sender half for bind completion updates.
pub type BindSender = UnboundedSender<BindUpdate>;

/// Asynchronous completion of a bind request.
pub enum BindUpdate {
    /// The transport reached the worker; the handle is live.
    Bound(Box<dyn WorkerHandle>),
    /// The link failed to establish or went away.
    Lost,
}

/// Identifies one listener registration so detach can match attach exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

impl ListenerToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The bound surface of a worker.
///
/// Listener registration is symmetric: every successful attach is matched by
/// exactly one detach, and detaching an unknown token is a no-op. The query
/// methods ask the worker to re-emit its current in-flight command status or
/// pending store-change status to the registered listeners; this is the
/// reconciliation pull that covers push events missed while unbound.
pub trait WorkerHandle: Send {
    fn add_action_listener(&mut self, listener: ActionSender) -> ListenerToken;
    fn remove_action_listener(&mut self, token: ListenerToken);
    fn add_store_listener(&mut self, listener: StoreSender) -> ListenerToken;
    fn remove_store_listener(&mut self, token: ListenerToken);

    /// Ask the worker to re-emit its current command status, if any.
    fn query_action_status(&mut self) -> Result<()>;
    /// Ask the worker to re-emit a pending store-change notice, if any.
    fn query_store_status(&mut self) -> Result<()>;
    /// Adopt the externally changed store state (conflict "accept").
    fn request_resync(&mut self) -> Result<()>;
}

/// Fire-and-forget access to the worker process.
///
/// `bind` completes asynchronously on the updates channel; a synchronous
/// error means the transport refused outright and the caller stays unbound.
/// `stop_current` and `start` are independent of bind state, mirroring a
/// one-shot service entry point: dispatching does not require (or cause) a
/// bound handle.
pub trait WorkerTransport {
    fn bind(&mut self, updates: BindSender) -> Result<()>;
    fn stop_current(&mut self) -> Result<()>;
    fn start(&mut self, command: &Command) -> Result<()>;

    /// Next delivery failure from a dispatch the transport completed in the
    /// background, if any. Transports whose `stop_current`/`start` fail
    /// synchronously have nothing to report here; the client drains this
    /// into its transient notices.
    fn next_dispatch_failure(&mut self) -> Option<StrongroomError> {
        None
    }
}
