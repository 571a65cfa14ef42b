//! Connection state machine toward the worker.
//!
//! Binding is asynchronous: `connect` asks the transport to bind and moves
//! to `Binding`; the transport later reports [`BindUpdate::Bound`] with a
//! live handle or [`BindUpdate::Lost`]. On a successful bind exactly one
//! action listener and one store-change listener are attached, then the
//! worker is asked for its current command status and store-change status.
//! This reconciliation pull covers a worker that started before this client
//! existed or while it was away.

use tracing::{debug, warn};

use crate::worker::{
    ActionSender, BindSender, BindUpdate, ListenerToken, StoreSender, WorkerHandle,
    WorkerTransport,
};

/// Bind progress toward the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Binding,
    Bound,
}

/// Owns the one live worker handle (at most) of a `TaskClient`.
///
/// The handle and its listener tokens are updated together, never
/// partially: either the connection is `Bound` with both listeners
/// attached, or it holds nothing.
pub struct ConnectionState {
    state: BindState,
    handle: Option<Box<dyn WorkerHandle>>,
    action_token: Option<ListenerToken>,
    store_token: Option<ListenerToken>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            state: BindState::Unbound,
            handle: None,
            action_token: None,
            store_token: None,
        }
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == BindState::Bound
    }

    /// Mutable access to the live handle, if bound.
    pub fn handle_mut(&mut self) -> Option<&mut (dyn WorkerHandle + 'static)> {
        self.handle.as_deref_mut()
    }

    /// Ask the transport to bind. Idempotent: a connection already binding
    /// or bound is left alone. A synchronous refusal keeps the state
    /// `Unbound` without notifying the caller; it learns via the next
    /// signal or an explicit retry.
    pub fn connect<T: WorkerTransport + ?Sized>(&mut self, transport: &mut T, updates: BindSender) {
        if self.state != BindState::Unbound {
            return;
        }
        match transport.bind(updates) {
            Ok(()) => self.state = BindState::Binding,
            Err(e) => warn!("worker bind refused: {e}"),
        }
    }

    /// Apply an asynchronous bind completion.
    ///
    /// A `Bound` arriving while not `Binding` (the client disconnected in
    /// the meantime) releases the handle unused.
    pub fn on_bind_update(
        &mut self,
        update: BindUpdate,
        action: ActionSender,
        store: StoreSender,
    ) {
        match update {
            BindUpdate::Bound(mut handle) => {
                if self.state != BindState::Binding {
                    debug!("dropping stale bind completion");
                    return;
                }
                self.action_token = Some(handle.add_action_listener(action));
                self.store_token = Some(handle.add_store_listener(store));
                if let Err(e) = handle.query_action_status() {
                    warn!("action status reconciliation failed: {e}");
                }
                if let Err(e) = handle.query_store_status() {
                    warn!("store status reconciliation failed: {e}");
                }
                self.handle = Some(handle);
                self.state = BindState::Bound;
            }
            BindUpdate::Lost => self.release(),
        }
    }

    /// Detach both listeners if attached, release the handle, return to
    /// `Unbound`. Safe to call from `Unbound`.
    pub fn disconnect(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Some(token) = self.action_token.take() {
                handle.remove_action_listener(token);
            }
            if let Some(token) = self.store_token.take() {
                handle.remove_store_listener(token);
            }
        }
        self.action_token = None;
        self.store_token = None;
        self.state = BindState::Unbound;
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    use crate::command::Command;
    use crate::error::{Result, StrongroomError};
    use crate::worker::StoreSender;

    #[derive(Default)]
    struct HandleStats {
        action_listeners: usize,
        store_listeners: usize,
        action_queries: usize,
        store_queries: usize,
        resyncs: usize,
    }

    struct FakeHandle {
        stats: Arc<Mutex<HandleStats>>,
        tokens: HashSet<u64>,
        next_token: u64,
    }

    impl FakeHandle {
        fn new(stats: Arc<Mutex<HandleStats>>) -> Self {
            Self {
                stats,
                tokens: HashSet::new(),
                next_token: 0,
            }
        }

        fn mint(&mut self) -> ListenerToken {
            self.next_token += 1;
            self.tokens.insert(self.next_token);
            ListenerToken::new(self.next_token)
        }
    }

    impl WorkerHandle for FakeHandle {
        fn add_action_listener(&mut self, _listener: ActionSender) -> ListenerToken {
            self.stats.lock().unwrap().action_listeners += 1;
            self.mint()
        }

        fn remove_action_listener(&mut self, token: ListenerToken) {
            if self.tokens.remove(&token.raw()) {
                self.stats.lock().unwrap().action_listeners -= 1;
            }
        }

        fn add_store_listener(&mut self, _listener: StoreSender) -> ListenerToken {
            self.stats.lock().unwrap().store_listeners += 1;
            self.mint()
        }

        fn remove_store_listener(&mut self, token: ListenerToken) {
            if self.tokens.remove(&token.raw()) {
                self.stats.lock().unwrap().store_listeners -= 1;
            }
        }

        fn query_action_status(&mut self) -> Result<()> {
            self.stats.lock().unwrap().action_queries += 1;
            Ok(())
        }

        fn query_store_status(&mut self) -> Result<()> {
            self.stats.lock().unwrap().store_queries += 1;
            Ok(())
        }

        fn request_resync(&mut self) -> Result<()> {
            self.stats.lock().unwrap().resyncs += 1;
            Ok(())
        }
    }

    struct CountingTransport {
        bind_calls: usize,
        refuse: bool,
    }

    impl WorkerTransport for CountingTransport {
        fn bind(&mut self, _updates: BindSender) -> Result<()> {
            self.bind_calls += 1;
            if self.refuse {
                Err(StrongroomError::WorkerConnection("refused".into()))
            } else {
                Ok(())
            }
        }

        fn stop_current(&mut self) -> Result<()> {
            Ok(())
        }

        fn start(&mut self, _command: &Command) -> Result<()> {
            Ok(())
        }
    }

    fn channels() -> (ActionSender, StoreSender, BindSender) {
        let (action, _) = mpsc::unbounded_channel();
        let (store, _) = mpsc::unbounded_channel();
        let (bind, _) = mpsc::unbounded_channel();
        (action, store, bind)
    }

    #[test]
    fn connect_is_idempotent_while_binding() {
        let mut transport = CountingTransport {
            bind_calls: 0,
            refuse: false,
        };
        let mut connection = ConnectionState::new();
        let (_, _, bind) = channels();

        connection.connect(&mut transport, bind.clone());
        connection.connect(&mut transport, bind.clone());
        connection.connect(&mut transport, bind);

        assert_eq!(transport.bind_calls, 1);
        assert_eq!(connection.state(), BindState::Binding);
    }

    #[test]
    fn refused_bind_stays_unbound() {
        let mut transport = CountingTransport {
            bind_calls: 0,
            refuse: true,
        };
        let mut connection = ConnectionState::new();
        let (_, _, bind) = channels();

        connection.connect(&mut transport, bind);
        assert_eq!(connection.state(), BindState::Unbound);
    }

    #[test]
    fn bound_update_attaches_listeners_and_reconciles() {
        let stats = Arc::new(Mutex::new(HandleStats::default()));
        let mut connection = ConnectionState::new();
        let mut transport = CountingTransport {
            bind_calls: 0,
            refuse: false,
        };
        let (action, store, bind) = channels();

        connection.connect(&mut transport, bind);
        connection.on_bind_update(
            BindUpdate::Bound(Box::new(FakeHandle::new(stats.clone()))),
            action,
            store,
        );

        assert!(connection.is_bound());
        let stats = stats.lock().unwrap();
        assert_eq!(stats.action_listeners, 1);
        assert_eq!(stats.store_listeners, 1);
        assert_eq!(stats.action_queries, 1);
        assert_eq!(stats.store_queries, 1);
    }

    #[test]
    fn stale_bound_update_is_released_unused() {
        let stats = Arc::new(Mutex::new(HandleStats::default()));
        let mut connection = ConnectionState::new();
        let (action, store, _) = channels();

        // Never connected: the completion is stale.
        connection.on_bind_update(
            BindUpdate::Bound(Box::new(FakeHandle::new(stats.clone()))),
            action,
            store,
        );

        assert_eq!(connection.state(), BindState::Unbound);
        assert_eq!(stats.lock().unwrap().action_listeners, 0);
    }

    #[test]
    fn disconnect_detaches_symmetrically_and_is_reentrant() {
        let stats = Arc::new(Mutex::new(HandleStats::default()));
        let mut connection = ConnectionState::new();
        let mut transport = CountingTransport {
            bind_calls: 0,
            refuse: false,
        };
        let (action, store, bind) = channels();

        connection.connect(&mut transport, bind);
        connection.on_bind_update(
            BindUpdate::Bound(Box::new(FakeHandle::new(stats.clone()))),
            action,
            store,
        );
        connection.disconnect();
        connection.disconnect();

        assert_eq!(connection.state(), BindState::Unbound);
        let stats = stats.lock().unwrap();
        assert_eq!(stats.action_listeners, 0);
        assert_eq!(stats.store_listeners, 0);
    }

    #[test]
    fn bound_handle_is_reachable_for_mutation() {
        let stats = Arc::new(Mutex::new(HandleStats::default()));
        let mut connection = ConnectionState::new();
        let mut transport = CountingTransport {
            bind_calls: 0,
            refuse: false,
        };
        let (action, store, bind) = channels();

        assert!(connection.handle_mut().is_none());

        connection.connect(&mut transport, bind);
        connection.on_bind_update(
            BindUpdate::Bound(Box::new(FakeHandle::new(stats.clone()))),
            action,
            store,
        );

        let handle = connection.handle_mut().unwrap();
        handle.request_resync().unwrap();
        assert_eq!(stats.lock().unwrap().resyncs, 1);

        connection.disconnect();
        assert!(connection.handle_mut().is_none());
    }

    #[test]
    fn lost_link_returns_to_unbound() {
        let stats = Arc::new(Mutex::new(HandleStats::default()));
        let mut connection = ConnectionState::new();
        let mut transport = CountingTransport {
            bind_calls: 0,
            refuse: false,
        };
        let (action, store, bind) = channels();

        connection.connect(&mut transport, bind);
        connection.on_bind_update(
            BindUpdate::Bound(Box::new(FakeHandle::new(stats))),
            action.clone(),
            store.clone(),
        );
        connection.on_bind_update(BindUpdate::Lost, action, store);

        assert_eq!(connection.state(), BindState::Unbound);
    }
}
