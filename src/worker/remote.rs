//! `WorkerTransport` over a Unix domain socket.
//!
//! The transport keeps two kinds of connections to the worker process. The
//! bound link is a persistent connection opened by `bind`: it sends a
//! subscribe request and then carries notifications back until either side
//! goes away. Dispatch (`stop_current`, `start`) uses short-lived one-shot
//! connections instead, so commands reach the worker whether or not a link
//! is up; a dispatch that finds no worker listening launches one when the
//! config names a launch command.
//!
//! All IO runs on spawned tokio tasks, so the transport must be used from
//! within a runtime. IO failures after the synchronous part of a call are
//! reported through the bind updates channel or the log, matching the
//! fire-and-forget contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::WorkerConfig;
use crate::error::{Result, StrongroomError};
use crate::worker::protocol::{
    self, WorkerNotification, WorkerOp, WorkerRequest,
};
use crate::worker::{
    ActionSender, BindSender, BindUpdate, ListenerToken, StoreSender, WorkerHandle,
};

/// Listener registrations shared between the handle and the reader task.
#[derive(Default)]
struct ListenerTable {
    next_token: u64,
    actions: HashMap<u64, ActionSender>,
    stores: HashMap<u64, StoreSender>,
}

impl ListenerTable {
    fn mint(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

type SharedListeners = Arc<Mutex<ListenerTable>>;

fn lock_table(table: &SharedListeners) -> std::sync::MutexGuard<'_, ListenerTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport reaching a worker over a Unix domain socket.
pub struct RemoteTransport {
    config: WorkerConfig,
    request_id: Arc<AtomicU64>,
    dispatch_tx: Option<UnboundedSender<WorkerRequest>>,
    failure_tx: UnboundedSender<StrongroomError>,
    failure_rx: mpsc::UnboundedReceiver<StrongroomError>,
}

impl RemoteTransport {
    pub fn new(config: WorkerConfig) -> Self {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        Self {
            config,
            request_id: Arc::new(AtomicU64::new(1)),
            dispatch_tx: None,
            failure_tx,
            failure_rx,
        }
    }

    /// Transport configured from `~/.strongroom/config.toml`.
    pub fn from_default_config() -> Result<Self> {
        Ok(Self::new(WorkerConfig::load()?))
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue one request for delivery on a short-lived connection, launching
    /// the worker first if needed. A single dispatcher task per transport
    /// delivers requests strictly in order, so a stop always reaches the
    /// worker before the start it precedes. Delivery errors surface in the
    /// log only.
    fn dispatch_one_shot(&mut self, op: WorkerOp) -> Result<()> {
        let request = WorkerRequest {
            id: self.next_request_id(),
            op,
        };
        let tx = match &self.dispatch_tx {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = spawn_dispatcher(self.config.clone(), self.failure_tx.clone())?;
                self.dispatch_tx = Some(tx.clone());
                tx
            }
        };
        tx.send(request)
            .map_err(|_| StrongroomError::Dispatch("worker dispatcher is gone".into()))
    }
}

/// Start the ordered dispatcher: one connection per request, sequentially.
/// Delivery failures go back on the failure channel so the client can turn
/// them into user notices.
fn spawn_dispatcher(
    config: WorkerConfig,
    failures: UnboundedSender<StrongroomError>,
) -> Result<UnboundedSender<WorkerRequest>> {
    let socket_path = config.resolved_socket_path()?;
    let launch = config.launch_command.clone();
    let retries = config.connect_retries();
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerRequest>();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match connect_or_launch(&socket_path, launch.as_deref(), retries).await {
                Ok(mut stream) => {
                    if let Err(e) = protocol::write_request(&mut stream, &request).await {
                        error!(id = request.id, "worker request failed: {e}");
                        let _ = failures.send(e);
                    }
                }
                Err(e) => {
                    error!(id = request.id, "worker unreachable: {e}");
                    let _ = failures.send(e);
                }
            }
        }
    });
    Ok(tx)
}

impl crate::worker::WorkerTransport for RemoteTransport {
    fn bind(&mut self, updates: BindSender) -> Result<()> {
        let socket_path = self.config.resolved_socket_path()?;
        let request_id = self.request_id.clone();
        tokio::spawn(async move {
            establish_link(socket_path, request_id, updates).await;
        });
        Ok(())
    }

    fn stop_current(&mut self) -> Result<()> {
        self.dispatch_one_shot(WorkerOp::Stop)
    }

    fn start(&mut self, command: &Command) -> Result<()> {
        self.dispatch_one_shot(WorkerOp::Start(command.clone()))
    }

    fn next_dispatch_failure(&mut self) -> Option<StrongroomError> {
        self.failure_rx.try_recv().ok()
    }
}

/// Open the persistent link: connect, subscribe, then hand out a
/// [`RemoteHandle`] and pump notifications until the stream dies.
async fn establish_link(socket_path: PathBuf, request_id: Arc<AtomicU64>, updates: BindSender) {
    let stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            // No worker running is the common idle case, not a fault.
            debug!(path = %socket_path.display(), "worker link unavailable: {e}");
            let _ = updates.send(BindUpdate::Lost);
            return;
        }
    };

    let (mut read_half, mut write_half) = stream.into_split();

    let subscribe = WorkerRequest {
        id: request_id.fetch_add(1, Ordering::Relaxed),
        op: WorkerOp::Subscribe,
    };
    if let Err(e) = protocol::write_request(&mut write_half, &subscribe).await {
        warn!("worker subscription failed: {e}");
        let _ = updates.send(BindUpdate::Lost);
        return;
    }

    let listeners: SharedListeners = Arc::new(Mutex::new(ListenerTable::default()));
    let (op_tx, mut op_rx) = mpsc::unbounded_channel::<WorkerOp>();

    let writer_updates = updates.clone();
    tokio::spawn(async move {
        while let Some(op) = op_rx.recv().await {
            let request = WorkerRequest {
                id: request_id.fetch_add(1, Ordering::Relaxed),
                op,
            };
            if let Err(e) = protocol::write_request(&mut write_half, &request).await {
                warn!(id = request.id, "worker link write failed: {e}");
                let _ = writer_updates.send(BindUpdate::Lost);
                return;
            }
        }
        // Handle dropped: the link is no longer wanted.
    });

    let reader_listeners = listeners.clone();
    let reader_updates = updates.clone();
    tokio::spawn(async move {
        loop {
            match protocol::read_notification(&mut read_half).await {
                Ok(WorkerNotification::Action(event)) => {
                    let table = lock_table(&reader_listeners);
                    for tx in table.actions.values() {
                        let _ = tx.send(event.clone());
                    }
                }
                Ok(WorkerNotification::StoreChanged(snapshot)) => {
                    let table = lock_table(&reader_listeners);
                    for tx in table.stores.values() {
                        let _ = tx.send(snapshot.clone());
                    }
                }
                Err(e) => {
                    debug!("worker link closed: {e}");
                    let _ = reader_updates.send(BindUpdate::Lost);
                    return;
                }
            }
        }
    });

    let handle = RemoteHandle { op_tx, listeners };
    let _ = updates.send(BindUpdate::Bound(Box::new(handle)));
}

/// Bound surface over the persistent link.
struct RemoteHandle {
    op_tx: UnboundedSender<WorkerOp>,
    listeners: SharedListeners,
}

impl RemoteHandle {
    fn send_op(&self, op: WorkerOp) -> Result<()> {
        self.op_tx
            .send(op)
            .map_err(|_| StrongroomError::WorkerConnection("worker link is down".into()))
    }
}

impl WorkerHandle for RemoteHandle {
    fn add_action_listener(&mut self, listener: ActionSender) -> ListenerToken {
        let mut table = lock_table(&self.listeners);
        let token = table.mint();
        table.actions.insert(token, listener);
        ListenerToken::new(token)
    }

    fn remove_action_listener(&mut self, token: ListenerToken) {
        lock_table(&self.listeners).actions.remove(&token.raw());
    }

    fn add_store_listener(&mut self, listener: StoreSender) -> ListenerToken {
        let mut table = lock_table(&self.listeners);
        let token = table.mint();
        table.stores.insert(token, listener);
        ListenerToken::new(token)
    }

    fn remove_store_listener(&mut self, token: ListenerToken) {
        lock_table(&self.listeners).stores.remove(&token.raw());
    }

    fn query_action_status(&mut self) -> Result<()> {
        self.send_op(WorkerOp::QueryAction)
    }

    fn query_store_status(&mut self) -> Result<()> {
        self.send_op(WorkerOp::QueryStore)
    }

    fn request_resync(&mut self) -> Result<()> {
        self.send_op(WorkerOp::Resync)
    }
}

/// Connect to the worker socket, launching the worker and retrying with a
/// growing delay when a launch command is configured.
async fn connect_or_launch(
    socket_path: &Path,
    launch: Option<&[String]>,
    retries: u32,
) -> Result<UnixStream> {
    match UnixStream::connect(socket_path).await {
        Ok(stream) => return Ok(stream),
        Err(e) => {
            let Some(launch) = launch else {
                return Err(StrongroomError::WorkerConnection(format!(
                    "worker not running at {}: {e}",
                    socket_path.display()
                )));
            };
            launch_worker(launch)?;
        }
    }

    for attempt in 0..retries {
        tokio::time::sleep(Duration::from_millis(50 * (u64::from(attempt) + 1))).await;
        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                info!(attempts = attempt + 1, "worker came up");
                return Ok(stream);
            }
            Err(e) => debug!(attempt = attempt + 1, "worker not ready yet: {e}"),
        }
    }
    Err(StrongroomError::WorkerConnection(format!(
        "worker did not come up at {} after {retries} attempts",
        socket_path.display()
    )))
}

fn launch_worker(command_line: &[String]) -> Result<()> {
    let (program, args) = command_line.split_first().ok_or_else(|| {
        StrongroomError::Config("launch_command must not be empty".into())
    })?;
    info!(worker = %program, "launching worker process");
    std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            StrongroomError::WorkerConnection(format!("failed to launch worker: {e}"))
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::UnixListener;
    use tokio::time::timeout;

    use crate::command::{keys, CommandId, ParamBag};
    use crate::model::{ActionResult, TextRef};
    use crate::worker::{ActionEvent, WorkerTransport};

    const TICK: Duration = Duration::from_secs(2);

    fn socket_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn transport_for(path: &Path) -> RemoteTransport {
        RemoteTransport::new(WorkerConfig {
            socket_path: Some(path.to_path_buf()),
            launch_command: None,
            connect_retries: Some(0),
        })
    }

    #[tokio::test]
    async fn bind_without_worker_reports_lost() {
        let dir = socket_dir();
        let mut transport = transport_for(&dir.path().join("absent.sock"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.bind(tx).unwrap();

        let update = timeout(TICK, rx.recv()).await.unwrap().unwrap();
        assert!(matches!(update, BindUpdate::Lost));
    }

    #[tokio::test]
    async fn bind_subscribes_and_streams_action_events() {
        let dir = socket_dir();
        let path = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // Scripted worker: expect subscribe then a status query, answer
        // with one progress event.
        let worker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = protocol::read_request(&mut stream).await.unwrap();
            assert_eq!(request.op, WorkerOp::Subscribe);

            let request = protocol::read_request(&mut stream).await.unwrap();
            assert_eq!(request.op, WorkerOp::QueryAction);

            let event = ActionEvent::Started {
                title: Some(TextRef::new("loading")),
                message: None,
                warning: None,
            };
            protocol::write_notification(&mut stream, &WorkerNotification::Action(event))
                .await
                .unwrap();
            stream
        });

        let mut transport = transport_for(&path);
        let (bind_tx, mut bind_rx) = mpsc::unbounded_channel();
        transport.bind(bind_tx).unwrap();

        let update = timeout(TICK, bind_rx.recv()).await.unwrap().unwrap();
        let BindUpdate::Bound(mut handle) = update else {
            panic!("expected a live handle");
        };

        let (action_tx, mut action_rx) = mpsc::unbounded_channel();
        let token = handle.add_action_listener(action_tx);
        handle.query_action_status().unwrap();

        let event = timeout(TICK, action_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, ActionEvent::Started { .. }));

        handle.remove_action_listener(token);
        drop(worker);
    }

    #[tokio::test]
    async fn lost_worker_is_reported_on_the_updates_channel() {
        let dir = socket_dir();
        let path = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let worker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = protocol::read_request(&mut stream).await.unwrap();
            // Connection dropped here.
        });

        let mut transport = transport_for(&path);
        let (bind_tx, mut bind_rx) = mpsc::unbounded_channel();
        transport.bind(bind_tx).unwrap();

        let update = timeout(TICK, bind_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(update, BindUpdate::Bound(_)));

        worker.await.unwrap();
        let update = timeout(TICK, bind_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(update, BindUpdate::Lost));
    }

    #[tokio::test]
    async fn unreachable_worker_reports_a_dispatch_failure() {
        let dir = socket_dir();
        let mut transport = transport_for(&dir.path().join("absent.sock"));

        transport.stop_current().unwrap();

        for _ in 0..100 {
            if let Some(failure) = transport.next_dispatch_failure() {
                assert!(matches!(failure, StrongroomError::WorkerConnection(_)));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("delivery failure never reached the failure channel");
    }

    #[tokio::test]
    async fn dispatch_sends_stop_then_start_on_one_shot_connections() {
        let dir = socket_dir();
        let path = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let worker = tokio::spawn(async move {
            let mut ops = Vec::new();
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                ops.push(protocol::read_request(&mut stream).await.unwrap().op);
            }
            ops
        });

        let mut transport = transport_for(&path);
        let mut bag = ParamBag::new();
        bag.flag(keys::PERSIST, true);
        let command = Command::new(CommandId::Save, bag).unwrap();

        transport.stop_current().unwrap();
        transport.start(&command).unwrap();

        let ops = timeout(TICK, worker).await.unwrap().unwrap();
        assert_eq!(ops[0], WorkerOp::Stop);
        assert_eq!(ops[1], WorkerOp::Start(command));
    }

    #[tokio::test]
    async fn stop_event_notification_reaches_listener() {
        let dir = socket_dir();
        let path = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let worker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = protocol::read_request(&mut stream).await.unwrap();
            let _ = protocol::read_request(&mut stream).await.unwrap();
            protocol::write_notification(
                &mut stream,
                &WorkerNotification::Action(ActionEvent::Stopped {
                    command: CommandId::Save,
                    result: ActionResult::ok(),
                }),
            )
            .await
            .unwrap();
            stream
        });

        let mut transport = transport_for(&path);
        let (bind_tx, mut bind_rx) = mpsc::unbounded_channel();
        transport.bind(bind_tx).unwrap();
        let BindUpdate::Bound(mut handle) = timeout(TICK, bind_rx.recv()).await.unwrap().unwrap()
        else {
            panic!("expected a live handle");
        };

        let (action_tx, mut action_rx) = mpsc::unbounded_channel();
        handle.add_action_listener(action_tx);
        handle.query_action_status().unwrap();

        let event = timeout(TICK, action_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            ActionEvent::Stopped {
                command: CommandId::Save,
                result: ActionResult::ok(),
            }
        );
        drop(worker);
    }
}
