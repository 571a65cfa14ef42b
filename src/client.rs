//! TaskClient: the UI-facing orchestrator.
//!
//! A `TaskClient` is created by a UI surface (screen, window, activity) and
//! composes the other pieces: it subscribes to the process-wide signal hub,
//! drives bind/unbind toward the worker, routes worker callbacks to the
//! progress and conflict surfaces, and exposes the command catalog's
//! dispatch methods.
//!
//! All state transitions happen on the thread that calls [`TaskClient::pump`]
//! (the UI thread); worker callbacks and signals arrive over channels and
//! are drained there. The client is deliberately not `Send`.
//!
//! # Example
//!
//! ```ignore
//! use strongroom::client::TaskClient;
//!
//! let mut client = TaskClient::with_global_hub(transport, surfaces);
//! client.register_progress_task();
//! client.start_update_name("Vault", "Personal", true);
//! // ... per UI frame / event-loop turn:
//! client.pump();
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, warn};

use crate::command::{self, keys, Command, CommandId, ParamBag};
use crate::connection::{BindState, ConnectionState};
use crate::model::{ActionResult, ConflictDecision, ConflictSnapshot, TextRef};
use crate::signal::{Signal, SignalHub, SignalSubscription};
use crate::surface::{
    ConflictSurface, ProgressSurface, SurfaceRegistry, PROGRESS_SURFACE, STORE_CHANGED_SURFACE,
};
use crate::worker::{
    ActionEvent, ActionSender, BindSender, BindUpdate, StoreSender, WorkerTransport,
};

/// Text reference queued as a transient notice when a dispatch fails.
pub const DISPATCH_FAILED_NOTICE: &str = "worker-dispatch-failed";

type FinishCallback = Box<dyn FnMut(CommandId, &ActionResult)>;

/// Client-side orchestrator binding one UI surface to the background worker.
pub struct TaskClient<T: WorkerTransport> {
    transport: T,
    connection: ConnectionState,
    hub: &'static SignalHub,
    signal_sub: Option<(SignalSubscription, UnboundedReceiver<Signal>)>,

    surfaces: Rc<RefCell<SurfaceRegistry>>,
    // Cached lookups into the registry. The registry outlives this client
    // (it is what recreation recovers from); the caches are this instance's
    // view and dismissal only acts through them.
    progress: Option<Rc<RefCell<ProgressSurface>>>,
    conflict: Option<Rc<RefCell<ConflictSurface>>>,

    action_tx: ActionSender,
    action_rx: UnboundedReceiver<ActionEvent>,
    store_tx: StoreSender,
    store_rx: UnboundedReceiver<ConflictSnapshot>,
    bind_tx: BindSender,
    bind_rx: UnboundedReceiver<BindUpdate>,

    on_action_finish: Option<FinishCallback>,
    notices: VecDeque<TextRef>,
}

impl<T: WorkerTransport> TaskClient<T> {
    /// Create a client over the given transport and surface registry,
    /// observing the given signal hub.
    pub fn new(
        transport: T,
        surfaces: Rc<RefCell<SurfaceRegistry>>,
        hub: &'static SignalHub,
    ) -> Self {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (bind_tx, bind_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            connection: ConnectionState::new(),
            hub,
            signal_sub: None,
            surfaces,
            progress: None,
            conflict: None,
            action_tx,
            action_rx,
            store_tx,
            store_rx,
            bind_tx,
            bind_rx,
            on_action_finish: None,
            notices: VecDeque::new(),
        }
    }

    /// Create a client observing the process-wide hub.
    pub fn with_global_hub(transport: T, surfaces: Rc<RefCell<SurfaceRegistry>>) -> Self {
        Self::new(transport, surfaces, SignalHub::global())
    }

    /// Callback invoked with the terminal result of a command. Fires on
    /// whichever registered client instance is bound when the worker stops,
    /// not only on the instance that dispatched.
    pub fn set_on_action_finish<F>(&mut self, callback: F)
    where
        F: FnMut(CommandId, &ActionResult) + 'static,
    {
        self.on_action_finish = Some(Box::new(callback));
    }

    /// The surface registry this client renders through.
    pub fn registry(&self) -> Rc<RefCell<SurfaceRegistry>> {
        self.surfaces.clone()
    }

    pub fn bind_state(&self) -> BindState {
        self.connection.state()
    }

    pub fn is_bound(&self) -> bool {
        self.connection.is_bound()
    }

    /// Next queued transient notice for the user, if any.
    pub fn next_notice(&mut self) -> Option<TextRef> {
        self.notices.pop_front()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start observing: subscribe to the signal hub and attempt to bind.
    ///
    /// Binding immediately (rather than waiting for a `task-started`
    /// signal) covers the case where a command is already running when this
    /// UI surface starts observing; the bind simply fails quietly if no
    /// worker is up.
    pub fn register_progress_task(&mut self) {
        self.dismiss_progress();
        if self.signal_sub.is_none() {
            self.signal_sub = Some(self.hub.subscribe());
        }
        self.connection
            .connect(&mut self.transport, self.bind_tx.clone());
    }

    /// Stop observing. Callable from any state; every step tolerates
    /// "nothing to undo". Does not stop the worker's command execution.
    pub fn unregister_progress_task(&mut self) {
        self.dismiss_progress();
        self.connection.disconnect();
        if let Some((subscription, _receiver)) = self.signal_sub.take() {
            self.hub.unsubscribe(subscription);
        }
    }

    /// Drain pending signals, bind completions, and worker events, routing
    /// them to the connection and the surfaces. Loops until one full pass
    /// delivers nothing, so synchronous cascades (signal → bind → replayed
    /// status) settle within a single call.
    pub fn pump(&mut self) {
        loop {
            let mut delivered = 0usize;

            let mut signals = Vec::new();
            if let Some((_, receiver)) = self.signal_sub.as_mut() {
                while let Ok(signal) = receiver.try_recv() {
                    signals.push(signal);
                }
            }
            for signal in signals {
                delivered += 1;
                self.handle_signal(signal);
            }

            while let Ok(update) = self.bind_rx.try_recv() {
                delivered += 1;
                self.connection
                    .on_bind_update(update, self.action_tx.clone(), self.store_tx.clone());
            }

            while let Ok(event) = self.action_rx.try_recv() {
                delivered += 1;
                self.handle_action_event(event);
            }

            while let Ok(snapshot) = self.store_rx.try_recv() {
                delivered += 1;
                self.present_conflict(snapshot);
            }

            while let Some(failure) = self.transport.next_dispatch_failure() {
                delivered += 1;
                error!("unable to deliver worker command: {failure}");
                self.notices.push_back(TextRef::new(DISPATCH_FAILED_NOTICE));
            }

            if delivered == 0 {
                break;
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::TaskStarted => {
                self.connection
                    .connect(&mut self.transport, self.bind_tx.clone());
            }
            Signal::TaskStopped => {
                // The task is over process-wide: clear the surface by
                // identity as well, covering a recreated client that never
                // cached a reference to it.
                self.progress = None;
                self.surfaces.borrow_mut().remove(PROGRESS_SURFACE);
                self.connection.disconnect();
            }
        }
    }

    fn handle_action_event(&mut self, event: ActionEvent) {
        match event {
            ActionEvent::Started {
                title,
                message,
                warning,
            } => self.ensure_progress(title, message, warning),
            ActionEvent::Updated {
                title,
                message,
                warning,
            } => self.update_progress(title, message, warning),
            ActionEvent::Stopped { command, result } => {
                if let Some(callback) = self.on_action_finish.as_mut() {
                    callback(command, &result);
                }
                self.dismiss_progress();
            }
        }
    }

    // ========================================================================
    // Surfaces
    // ========================================================================

    fn ensure_progress(
        &mut self,
        title: Option<TextRef>,
        message: Option<TextRef>,
        warning: Option<TextRef>,
    ) {
        if self.progress.is_none() {
            self.progress = self.surfaces.borrow().find_progress();
        }
        if self.progress.is_none() {
            self.progress = Some(self.surfaces.borrow_mut().create_progress());
        }
        self.update_progress(title, message, warning);
    }

    fn update_progress(
        &mut self,
        title: Option<TextRef>,
        message: Option<TextRef>,
        warning: Option<TextRef>,
    ) {
        if let Some(surface) = &self.progress {
            surface.borrow_mut().apply(title, message, warning);
        }
    }

    fn dismiss_progress(&mut self) {
        if self.progress.take().is_some() {
            self.surfaces.borrow_mut().remove(PROGRESS_SURFACE);
        }
    }

    fn present_conflict(&mut self, snapshot: ConflictSnapshot) {
        if self.conflict.is_none() {
            self.conflict = self.surfaces.borrow().find_conflict();
        }
        match &self.conflict {
            Some(surface) => surface.borrow_mut().replace(snapshot),
            None => {
                self.conflict = Some(self.surfaces.borrow_mut().create_conflict(snapshot));
            }
        }
    }

    /// Relay the user's decision for the presented conflict.
    ///
    /// At most one decision is relayed per presented snapshot; accepting
    /// the external state delegates to the worker's resync operation. The
    /// conflict surface is dismissed either way.
    pub fn resolve_store_conflict(&mut self, decision: ConflictDecision) {
        if self.conflict.is_none() {
            self.conflict = self.surfaces.borrow().find_conflict();
        }
        let Some(surface) = self.conflict.take() else {
            debug!("conflict decision with no surface presented");
            return;
        };
        if surface.borrow_mut().resolve() && decision == ConflictDecision::AcceptExternal {
            match self.connection.handle_mut() {
                Some(handle) => {
                    if let Err(e) = handle.request_resync() {
                        warn!("store resync request failed: {e}");
                    }
                }
                None => debug!("store resync requested while unbound"),
            }
        }
        self.surfaces.borrow_mut().remove(STORE_CHANGED_SURFACE);
    }

    // ========================================================================
    // Dispatch core
    // ========================================================================

    /// Build and dispatch one command. Failures (schema or transport) are
    /// logged, queued as a transient user notice, and contained here; the
    /// connection state is never touched.
    fn start(&mut self, id: CommandId, params: ParamBag) {
        let command = match Command::new(id, params) {
            Ok(command) => command,
            Err(e) => {
                error!(command = %id, "refusing to dispatch: {e}");
                self.notices.push_back(TextRef::new(DISPATCH_FAILED_NOTICE));
                return;
            }
        };
        if let Err(e) = command::dispatch(&mut self.transport, &command) {
            error!(command = %id, "unable to dispatch worker command: {e}");
            self.notices.push_back(TextRef::new(DISPATCH_FAILED_NOTICE));
        }
    }

    // ========================================================================
    // Command catalog: store operations
    // ========================================================================

    pub fn start_store_create(&mut self, store_uri: &str, credentials: serde_json::Value) {
        let mut params = ParamBag::new();
        params
            .text(keys::STORE_URI, store_uri)
            .node(keys::CREDENTIALS, credentials);
        self.start(CommandId::Create, params);
    }

    pub fn start_store_load(
        &mut self,
        store_uri: &str,
        credentials: serde_json::Value,
        read_only: bool,
        credential_cache: Option<serde_json::Value>,
        fix_duplicate_ids: bool,
    ) {
        let mut params = ParamBag::new();
        params
            .text(keys::STORE_URI, store_uri)
            .node(keys::CREDENTIALS, credentials)
            .flag(keys::READ_ONLY, read_only)
            .flag(keys::FIX_DUPLICATE_IDS, fix_duplicate_ids);
        if let Some(cache) = credential_cache {
            params.node(keys::CREDENTIAL_CACHE, cache);
        }
        self.start(CommandId::Load, params);
    }

    pub fn start_store_reload(&mut self, fix_duplicate_ids: bool) {
        let mut params = ParamBag::new();
        params.flag(keys::FIX_DUPLICATE_IDS, fix_duplicate_ids);
        self.start(CommandId::Reload, params);
    }

    pub fn start_assign_credentials(&mut self, store_uri: &str, credentials: serde_json::Value) {
        let mut params = ParamBag::new();
        params
            .text(keys::STORE_URI, store_uri)
            .node(keys::CREDENTIALS, credentials);
        self.start(CommandId::AssignCredentials, params);
    }

    // ========================================================================
    // Command catalog: node operations
    // ========================================================================

    pub fn start_create_group(&mut self, group: serde_json::Value, parent_id: &str, persist: bool) {
        let mut params = ParamBag::new();
        params
            .node(keys::GROUP, group)
            .text(keys::PARENT_ID, parent_id)
            .flag(keys::PERSIST, persist);
        self.start(CommandId::CreateGroup, params);
    }

    pub fn start_update_group(&mut self, group_id: &str, group: serde_json::Value, persist: bool) {
        let mut params = ParamBag::new();
        params
            .text(keys::GROUP_ID, group_id)
            .node(keys::GROUP, group)
            .flag(keys::PERSIST, persist);
        self.start(CommandId::UpdateGroup, params);
    }

    pub fn start_create_entry(&mut self, entry: serde_json::Value, parent_id: &str, persist: bool) {
        let mut params = ParamBag::new();
        params
            .node(keys::ENTRY, entry)
            .text(keys::PARENT_ID, parent_id)
            .flag(keys::PERSIST, persist);
        self.start(CommandId::CreateEntry, params);
    }

    pub fn start_update_entry(&mut self, entry_id: &str, entry: serde_json::Value, persist: bool) {
        let mut params = ParamBag::new();
        params
            .text(keys::ENTRY_ID, entry_id)
            .node(keys::ENTRY, entry)
            .flag(keys::PERSIST, persist);
        self.start(CommandId::UpdateEntry, params);
    }

    fn start_node_set(
        &mut self,
        id: CommandId,
        group_ids: Vec<String>,
        entry_ids: Vec<String>,
        new_parent_id: Option<&str>,
        persist: bool,
    ) {
        let mut params = ParamBag::new();
        params
            .list(keys::GROUP_IDS, group_ids)
            .list(keys::ENTRY_IDS, entry_ids);
        if let Some(parent) = new_parent_id {
            params.text(keys::PARENT_ID, parent);
        }
        params.flag(keys::PERSIST, persist);
        self.start(id, params);
    }

    pub fn start_copy_nodes(
        &mut self,
        group_ids: Vec<String>,
        entry_ids: Vec<String>,
        new_parent_id: &str,
        persist: bool,
    ) {
        self.start_node_set(
            CommandId::CopyNodes,
            group_ids,
            entry_ids,
            Some(new_parent_id),
            persist,
        );
    }

    pub fn start_move_nodes(
        &mut self,
        group_ids: Vec<String>,
        entry_ids: Vec<String>,
        new_parent_id: &str,
        persist: bool,
    ) {
        self.start_node_set(
            CommandId::MoveNodes,
            group_ids,
            entry_ids,
            Some(new_parent_id),
            persist,
        );
    }

    pub fn start_delete_nodes(
        &mut self,
        group_ids: Vec<String>,
        entry_ids: Vec<String>,
        persist: bool,
    ) {
        self.start_node_set(CommandId::DeleteNodes, group_ids, entry_ids, None, persist);
    }

    // ========================================================================
    // Command catalog: entry history
    // ========================================================================

    pub fn start_restore_entry_history(&mut self, entry_id: &str, position: i64, persist: bool) {
        let mut params = ParamBag::new();
        params
            .text(keys::ENTRY_ID, entry_id)
            .int(keys::HISTORY_POSITION, position)
            .flag(keys::PERSIST, persist);
        self.start(CommandId::RestoreEntryHistory, params);
    }

    pub fn start_delete_entry_history(&mut self, entry_id: &str, position: i64, persist: bool) {
        let mut params = ParamBag::new();
        params
            .text(keys::ENTRY_ID, entry_id)
            .int(keys::HISTORY_POSITION, position)
            .flag(keys::PERSIST, persist);
        self.start(CommandId::DeleteEntryHistory, params);
    }

    // ========================================================================
    // Command catalog: store settings
    // ========================================================================

    fn start_setting_text(&mut self, id: CommandId, old: &str, new: &str, persist: bool) {
        let mut params = ParamBag::new();
        params
            .text(keys::OLD, old)
            .text(keys::NEW, new)
            .flag(keys::PERSIST, persist);
        self.start(id, params);
    }

    fn start_setting_int(&mut self, id: CommandId, old: i64, new: i64, persist: bool) {
        let mut params = ParamBag::new();
        params
            .int(keys::OLD, old)
            .int(keys::NEW, new)
            .flag(keys::PERSIST, persist);
        self.start(id, params);
    }

    pub fn start_update_name(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateName, old, new, persist);
    }

    pub fn start_update_description(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateDescription, old, new, persist);
    }

    pub fn start_update_default_username(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateDefaultUsername, old, new, persist);
    }

    pub fn start_update_color(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateColor, old, new, persist);
    }

    pub fn start_update_compression(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateCompression, old, new, persist);
    }

    pub fn start_remove_unlinked_data(&mut self, persist: bool) {
        let mut params = ParamBag::new();
        params.flag(keys::PERSIST, persist);
        self.start(CommandId::RemoveUnlinkedData, params);
    }

    pub fn start_update_max_history_items(&mut self, old: i64, new: i64, persist: bool) {
        self.start_setting_int(CommandId::UpdateMaxHistoryItems, old, new, persist);
    }

    pub fn start_update_max_history_size(&mut self, old: i64, new: i64, persist: bool) {
        self.start_setting_int(CommandId::UpdateMaxHistorySize, old, new, persist);
    }

    // ========================================================================
    // Command catalog: security settings
    // ========================================================================

    pub fn start_update_encryption(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateEncryption, old, new, persist);
    }

    pub fn start_update_key_derivation(&mut self, old: &str, new: &str, persist: bool) {
        self.start_setting_text(CommandId::UpdateKeyDerivation, old, new, persist);
    }

    pub fn start_update_iterations(&mut self, old: i64, new: i64, persist: bool) {
        self.start_setting_int(CommandId::UpdateIterations, old, new, persist);
    }

    pub fn start_update_memory_usage(&mut self, old: i64, new: i64, persist: bool) {
        self.start_setting_int(CommandId::UpdateMemoryUsage, old, new, persist);
    }

    pub fn start_update_parallelism(&mut self, old: i64, new: i64, persist: bool) {
        self.start_setting_int(CommandId::UpdateParallelism, old, new, persist);
    }

    // ========================================================================
    // Command catalog: save
    // ========================================================================

    pub fn start_save(&mut self, persist: bool) {
        let mut params = ParamBag::new();
        params.flag(keys::PERSIST, persist);
        self.start(CommandId::Save, params);
    }
}
