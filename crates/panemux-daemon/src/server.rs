//! Unix-socket IPC server: handshakes, message routing, event streaming and
//! privileged control operations.
//!
//! Per connection: a reader task decoding frames and dispatching, a writer
//! task draining a bounded outbound queue, and a forwarder moving bus events
//! into that queue. A full outbound queue terminates the connection. Peer
//! credentials are captured at accept time and checked by the permission
//! gate per operation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panemux_core::{StateEvent, StateEventType, StateUpdate};
use panemux_tmux::session::list_clients;
use panemux_tmux::TmuxCommandRunner;

use crate::bus::EventBus;
use crate::clients::ClientCounter;
use crate::codec::IpcCodec;
use crate::coordinator::{CoordinatorError, StateCoordinator};
use crate::gate::{GateDenied, Operation, PeerCredentials, PermissionGate};
use crate::orchestrator::ShutdownRequest;
use crate::protocol::{
    validate_handshake, ErrorCode, ErrorData, HandshakeData, HandshakeResponseData,
    HeartbeatData, IpcMessage, MessageType, ShutdownData, StateUpdateResponseData,
    SubscribeData,
};
use crate::repository::FileRepository;
use crate::supervisor::SupervisorState;

/// Commands the server forwards to the orchestrator.
#[derive(Debug)]
pub enum ControlCommand {
    ReloadLayout,
}

/// Live view of one supervised pane, shared with the `status` surface.
#[derive(Clone)]
pub struct PaneView {
    pub role: String,
    pub target: String,
    pub state: Arc<Mutex<SupervisorState>>,
}

/// Registry of supervised panes, maintained by the orchestrator.
pub type PaneRegistry = Arc<Mutex<Vec<PaneView>>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub handshake_timeout: Duration,
    pub outbound_queue_depth: usize,
    pub drain_timeout: Duration,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handshake_timeout: Duration::from_secs(10),
            outbound_queue_depth: 256,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a connection handler needs, cloned per connection.
pub struct ServerDeps<R> {
    pub session: String,
    pub coordinator: Arc<StateCoordinator>,
    pub bus: Arc<EventBus>,
    pub gate: Arc<PermissionGate>,
    pub repository: Arc<FileRepository>,
    pub runner: Arc<R>,
    pub counter: ClientCounter,
    pub panes: PaneRegistry,
    pub shutdown_tx: mpsc::Sender<ShutdownRequest>,
    pub control_tx: mpsc::Sender<ControlCommand>,
}

impl<R> Clone for ServerDeps<R> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            coordinator: Arc::clone(&self.coordinator),
            bus: Arc::clone(&self.bus),
            gate: Arc::clone(&self.gate),
            repository: Arc::clone(&self.repository),
            runner: Arc::clone(&self.runner),
            counter: self.counter.clone(),
            panes: Arc::clone(&self.panes),
            shutdown_tx: self.shutdown_tx.clone(),
            control_tx: self.control_tx.clone(),
        }
    }
}

/// Per-connection lifecycle, for logs and the drain bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Connected,
    Handshaking,
    Active,
    Closing,
}

pub struct IpcServer<R> {
    config: ServerConfig,
    deps: ServerDeps<R>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl<R: TmuxCommandRunner + 'static> IpcServer<R> {
    pub fn new(config: ServerConfig, deps: ServerDeps<R>, cancel: CancellationToken) -> Self {
        Self {
            config,
            deps,
            cancel,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind, accept, and serve until cancelled; then drain connections up to
    /// the grace period before force-closing.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = UnixListener::bind(&self.config.socket_path)?;
        // Owner read/write only.
        std::fs::set_permissions(
            &self.config.socket_path,
            std::os::unix::fs::PermissionsExt::from_mode(0o600),
        )?;
        info!(path = %self.config.socket_path.display(), "ipc server listening");

        // Connections outlive the accept loop during the drain window, so
        // they watch their own token.
        let conn_cancel = CancellationToken::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let peer = match peer_credentials(&stream) {
                                Ok(peer) => peer,
                                Err(e) => {
                                    warn!(error = %e, "peer credentials unavailable, dropping connection");
                                    continue;
                                }
                            };
                            let deps = self.deps.clone();
                            let config = self.config.clone();
                            let active = Arc::clone(&self.active);
                            let token = conn_cancel.clone();
                            active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                handle_connection(stream, peer, deps, config, token).await;
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("ipc server: stopping accept loop");
                    break;
                }
            }
        }

        // Drain active connections, then force-close the stragglers.
        drop(listener);
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "drain window expired, force-closing connections");
        }
        conn_cancel.cancel();

        let _ = std::fs::remove_file(&self.config.socket_path);
        Ok(())
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Extract uid/gid/pid from the accepted socket.
fn peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    let cred = stream.peer_cred()?;
    Ok(PeerCredentials {
        uid: cred.uid(),
        gid: cred.gid(),
        pid: cred.pid(),
    })
}

async fn handle_connection<R: TmuxCommandRunner + 'static>(
    stream: UnixStream,
    peer: PeerCredentials,
    deps: ServerDeps<R>,
    config: ServerConfig,
    cancel: CancellationToken,
) {
    let mut phase = ConnPhase::Connected;
    debug!(uid = peer.uid, pid = ?peer.pid, ?phase, "connection accepted");

    let framed = Framed::new(stream, IpcCodec::new());
    let (mut sink, mut frames) = framed.split();

    // Writer task: single bounded outbound queue for responses and events.
    let (out_tx, mut out_rx) = mpsc::channel::<IpcMessage>(config.outbound_queue_depth);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // --- handshake, bounded by its own deadline ---
    phase = ConnPhase::Handshaking;
    debug!(uid = peer.uid, ?phase, "awaiting handshake");
    let handshake =
        match tokio::time::timeout(config.handshake_timeout, frames.next()).await {
            Ok(Some(Ok(frame))) if frame.msg_type == MessageType::Handshake => frame,
            Ok(Some(Ok(frame))) => {
                let _ = out_tx
                    .send(IpcMessage::error(
                        ErrorCode::InvalidMessage,
                        format!("expected handshake, got {:?}", frame.msg_type),
                        None,
                    ))
                    .await;
                drop(out_tx);
                let _ = writer.await;
                return;
            }
            Ok(Some(Err(e))) => {
                debug!(error = %e, "frame error before handshake");
                drop(out_tx);
                let _ = writer.await;
                return;
            }
            Ok(None) => {
                drop(out_tx);
                let _ = writer.await;
                return;
            }
            Err(_elapsed) => {
                let _ = out_tx
                    .send(IpcMessage::error(
                        ErrorCode::Timeout,
                        "handshake deadline exceeded",
                        None,
                    ))
                    .await;
                drop(out_tx);
                let _ = writer.await;
                return;
            }
        };

    let hs: HandshakeData = match serde_json::from_value(handshake.data.clone()) {
        Ok(hs) => hs,
        Err(e) => {
            let _ = out_tx
                .send(IpcMessage::error(
                    ErrorCode::InvalidMessage,
                    format!("malformed handshake: {e}"),
                    None,
                ))
                .await;
            drop(out_tx);
            let _ = writer.await;
            return;
        }
    };

    if let Err(e) = validate_handshake(&hs) {
        warn!(panel_id = %hs.panel_id, error = %e, "handshake rejected");
        let response = HandshakeResponseData {
            success: false,
            connection_id: String::new(),
            server_time: chrono::Utc::now(),
            error: Some(e.to_string()),
        };
        let _ = out_tx
            .send(IpcMessage::reply_to(
                &handshake,
                MessageType::HandshakeResponse,
                serde_json::to_value(&response).unwrap_or(serde_json::Value::Null),
            ))
            .await;
        let _ = out_tx
            .send(IpcMessage::error(ErrorCode::AuthFailed, e.to_string(), None))
            .await;
        drop(out_tx);
        let _ = writer.await;
        return;
    }

    let connection_id = uuid::Uuid::new_v4().to_string();
    let response = HandshakeResponseData {
        success: true,
        connection_id: connection_id.clone(),
        server_time: chrono::Utc::now(),
        error: None,
    };
    if out_tx
        .send(IpcMessage::reply_to(
            &handshake,
            MessageType::HandshakeResponse,
            serde_json::to_value(&response).unwrap_or(serde_json::Value::Null),
        ))
        .await
        .is_err()
    {
        let _ = writer.await;
        return;
    }

    phase = ConnPhase::Active;
    info!(
        panel_id = %hs.panel_id,
        panel_type = %hs.panel_type,
        connection_id = %connection_id,
        uid = peer.uid,
        ?phase,
        "panel connected"
    );

    // --- event stream: bus -> subscription filter -> outbound queue ---
    let filter: Arc<Mutex<Option<Vec<StateEventType>>>> = Arc::new(Mutex::new(None));
    let (event_tx, mut event_rx) = mpsc::channel::<StateEvent>(config.outbound_queue_depth);
    deps.bus.subscribe(&hs.panel_id, &hs.panel_type, event_tx);

    // `conn_close` fires when the forwarder gives up (full outbound queue),
    // waking the reader loop below.
    let conn_close = CancellationToken::new();
    let forward_filter = Arc::clone(&filter);
    let forward_out = out_tx.clone();
    let forward_cancel = cancel.clone();
    let forward_close = conn_close.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let wanted = {
                        let filter = forward_filter.lock().unwrap_or_else(|e| e.into_inner());
                        match filter.as_ref() {
                            None => true,
                            Some(types) => types.contains(&event.event_type),
                        }
                    };
                    if !wanted {
                        continue;
                    }
                    let frame = IpcMessage::new(
                        MessageType::StateEvent,
                        serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
                    );
                    if forward_out.try_send(frame).is_err() {
                        // Outbound queue full or closed: terminate rather
                        // than buffer without bound.
                        warn!("outbound queue full, closing connection");
                        break;
                    }
                }
                _ = forward_cancel.cancelled() => break,
            }
        }
        forward_close.cancel();
    });

    // --- reader loop ---
    let mut heartbeat_seq: u64 = 0;
    loop {
        tokio::select! {
            frame = frames.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(panel_id = %hs.panel_id, error = %e, "frame decode error");
                        break;
                    }
                    None => break,
                };
                let keep_going = dispatch_frame(
                    &deps,
                    &peer,
                    &hs,
                    &filter,
                    &mut heartbeat_seq,
                    frame,
                    &out_tx,
                )
                .await;
                if !keep_going {
                    break;
                }
            }
            _ = conn_close.cancelled() => break,
            _ = cancel.cancelled() => break,
        }
    }

    phase = ConnPhase::Closing;
    debug!(panel_id = %hs.panel_id, ?phase, "connection closing");
    deps.bus.unsubscribe(&hs.panel_id);
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    info!(panel_id = %hs.panel_id, connection_id = %connection_id, "panel disconnected");
}

/// Route one decoded frame. Returns `false` to close the connection.
async fn dispatch_frame<R: TmuxCommandRunner>(
    deps: &ServerDeps<R>,
    peer: &PeerCredentials,
    hs: &HandshakeData,
    filter: &Arc<Mutex<Option<Vec<StateEventType>>>>,
    heartbeat_seq: &mut u64,
    frame: IpcMessage,
    out_tx: &mpsc::Sender<IpcMessage>,
) -> bool {
    match frame.msg_type {
        MessageType::Ping => {
            send_or_close(out_tx, IpcMessage::reply_to(&frame, MessageType::Pong, serde_json::json!({}))).await
        }
        MessageType::Pong => true,
        MessageType::Heartbeat => {
            if let Ok(hb) = serde_json::from_value::<HeartbeatData>(frame.data) {
                if hb.sequence > *heartbeat_seq + 1 && *heartbeat_seq > 0 {
                    debug!(
                        panel_id = %hs.panel_id,
                        expected = *heartbeat_seq + 1,
                        got = hb.sequence,
                        "heartbeat gap"
                    );
                }
                *heartbeat_seq = hb.sequence;
            }
            true
        }
        MessageType::Subscribe => {
            if let Ok(sub) = serde_json::from_value::<SubscribeData>(frame.data) {
                let mut filter = filter.lock().unwrap_or_else(|e| e.into_inner());
                match filter.as_mut() {
                    Some(types) => {
                        for t in sub.event_types {
                            if !types.contains(&t) {
                                types.push(t);
                            }
                        }
                    }
                    None => *filter = Some(sub.event_types),
                }
            }
            true
        }
        MessageType::Unsubscribe => {
            if let Ok(sub) = serde_json::from_value::<SubscribeData>(frame.data) {
                let mut filter = filter.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(types) = filter.as_mut() {
                    types.retain(|t| !sub.event_types.contains(t));
                }
            }
            true
        }
        MessageType::StateRequest => {
            if let Err(denied) = deps.gate.check(Operation::StateRead, peer) {
                return send_denial(out_tx, denied).await;
            }
            let state = deps.coordinator.state();
            let reply = IpcMessage::reply_to(
                &frame,
                MessageType::StateResponse,
                serde_json::json!({ "state": state }),
            );
            send_or_close(out_tx, reply).await
        }
        MessageType::StateUpdate => {
            if let Err(denied) = deps.gate.check(Operation::StateMutation, peer) {
                return send_denial(out_tx, denied).await;
            }
            let update: StateUpdate = match serde_json::from_value(frame.data.clone()) {
                Ok(update) => update,
                Err(e) => {
                    return send_or_close(
                        out_tx,
                        IpcMessage::error(
                            ErrorCode::InvalidMessage,
                            format!("malformed state update: {e}"),
                            None,
                        ),
                    )
                    .await;
                }
            };
            let response = match deps.coordinator.apply_update(update).await {
                Ok(applied) => StateUpdateResponseData {
                    success: true,
                    version: applied.version,
                    error: None,
                },
                Err(e) => StateUpdateResponseData {
                    success: false,
                    version: deps.coordinator.current_version(),
                    error: Some(ErrorData {
                        code: match &e {
                            CoordinatorError::VersionConflict { .. } => ErrorCode::VersionConflict,
                            CoordinatorError::TooManyRetries { .. } => ErrorCode::TooManyRetries,
                            CoordinatorError::Repository(_) => ErrorCode::InternalError,
                        },
                        message: e.to_string(),
                        details: None,
                    }),
                },
            };
            send_or_close(
                out_tx,
                IpcMessage::reply_to(
                    &frame,
                    MessageType::StateUpdateResponse,
                    serde_json::to_value(&response).unwrap_or(serde_json::Value::Null),
                ),
            )
            .await
        }
        MessageType::Shutdown => {
            let request: ShutdownData =
                serde_json::from_value(frame.data.clone()).unwrap_or(ShutdownData {
                    cleanup: false,
                    force: false,
                });
            let attached = deps.counter.count();
            if let Err(denied) =
                deps.gate
                    .check_shutdown(peer, request.cleanup, attached, request.force)
            {
                warn!(uid = peer.uid, error = %denied, "shutdown denied");
                return send_denial(out_tx, denied).await;
            }
            let ack = IpcMessage::reply_to(
                &frame,
                MessageType::Shutdown,
                serde_json::json!({ "success": true }),
            );
            let ok = send_or_close(out_tx, ack).await;
            let _ = deps
                .shutdown_tx
                .send(ShutdownRequest {
                    cleanup: request.cleanup,
                    reason: format!("ipc shutdown from panel {}", hs.panel_id),
                })
                .await;
            ok
        }
        MessageType::ReloadLayout => {
            if let Err(denied) = deps.gate.check(Operation::ReloadLayout, peer) {
                return send_denial(out_tx, denied).await;
            }
            let _ = deps.control_tx.send(ControlCommand::ReloadLayout).await;
            send_or_close(
                out_tx,
                IpcMessage::reply_to(
                    &frame,
                    MessageType::ReloadLayout,
                    serde_json::json!({ "success": true }),
                ),
            )
            .await
        }
        MessageType::Status => {
            if let Err(denied) = deps.gate.check(Operation::Status, peer) {
                return send_denial(out_tx, denied).await;
            }
            let status = build_status(deps);
            send_or_close(
                out_tx,
                IpcMessage::reply_to(
                    &frame,
                    MessageType::Status,
                    serde_json::to_value(&status).unwrap_or(serde_json::Value::Null),
                ),
            )
            .await
        }
        MessageType::ListClients => {
            if let Err(denied) = deps.gate.check(Operation::ListClients, peer) {
                return send_denial(out_tx, denied).await;
            }
            let clients = match list_clients(deps.runner.as_ref(), &deps.session).await {
                Ok(clients) => clients,
                Err(e) => {
                    return send_or_close(
                        out_tx,
                        IpcMessage::error(ErrorCode::InternalError, e.to_string(), None),
                    )
                    .await;
                }
            };
            let entries: Vec<serde_json::Value> = clients
                .iter()
                .map(|c| serde_json::json!({ "tty": c.tty, "pid": c.pid, "name": c.name }))
                .collect();
            send_or_close(
                out_tx,
                IpcMessage::reply_to(
                    &frame,
                    MessageType::ListClients,
                    serde_json::json!({ "clients": entries }),
                ),
            )
            .await
        }
        MessageType::Handshake
        | MessageType::HandshakeResponse
        | MessageType::StateUpdateResponse
        | MessageType::StateResponse
        | MessageType::StateEvent
        | MessageType::Error => {
            send_or_close(
                out_tx,
                IpcMessage::error(
                    ErrorCode::InvalidMessage,
                    format!("unexpected message type: {:?}", frame.msg_type),
                    None,
                ),
            )
            .await
        }
    }
}

/// Daemon status snapshot served to `status` requests.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub session: String,
    pub daemon_version: String,
    pub uptime_seconds: i64,
    pub state_version: u64,
    pub attached_clients: usize,
    pub panes: Vec<PaneStatusEntry>,
    pub metrics: crate::coordinator::CoordinatorMetrics,
    pub conflicts: crate::conflict::ConflictStats,
    pub repository: crate::repository::RepositoryStats,
}

#[derive(Debug, Serialize)]
pub struct PaneStatusEntry {
    pub role: String,
    pub target: String,
    pub state: SupervisorState,
}

fn build_status<R>(deps: &ServerDeps<R>) -> StatusReport {
    let panes = {
        let panes = deps.panes.lock().unwrap_or_else(|e| e.into_inner());
        panes
            .iter()
            .map(|view| PaneStatusEntry {
                role: view.role.clone(),
                target: view.target.clone(),
                state: *view.state.lock().unwrap_or_else(|e| e.into_inner()),
            })
            .collect()
    };
    StatusReport {
        session: deps.session.clone(),
        daemon_version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (chrono::Utc::now() - deps.gate.ownership().started_at).num_seconds(),
        state_version: deps.coordinator.current_version(),
        attached_clients: deps.counter.count(),
        panes,
        metrics: deps.coordinator.metrics(),
        conflicts: deps.coordinator.conflict_stats(),
        repository: deps.repository.stats(),
    }
}

async fn send_or_close(out_tx: &mpsc::Sender<IpcMessage>, frame: IpcMessage) -> bool {
    match out_tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("outbound queue full, closing connection");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn send_denial(out_tx: &mpsc::Sender<IpcMessage>, denied: GateDenied) -> bool {
    send_or_close(
        out_tx,
        IpcMessage::error(ErrorCode::AuthFailed, denied.to_string(), None),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::coordinator::{CoordinatorConfig, StateCoordinator};
    use crate::repository::{FileRepository, RepositoryConfig};
    use panemux_core::{SessionEntry, SessionOwnership, UpdatePayload};
    use panemux_tmux::TmuxError;

    struct NoTmux;
    impl TmuxCommandRunner for NoTmux {
        async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
            match args[0] {
                "list-clients" => Ok("/dev/ttys001\t4242\tclient0\n".into()),
                _ => Ok(String::new()),
            }
        }
    }

    struct Harness {
        socket_path: PathBuf,
        coordinator: Arc<StateCoordinator>,
        shutdown_rx: mpsc::Receiver<ShutdownRequest>,
        cancel: CancellationToken,
        server: tokio::task::JoinHandle<std::io::Result<()>>,
        _tmp: tempfile::TempDir,
    }

    fn start_server(ownership: SessionOwnership) -> Harness {
        let tmp = tempfile::tempdir().expect("tempdir");
        let socket_path = tmp.path().join("work.sock");

        let repository = Arc::new(FileRepository::new(RepositoryConfig::new(
            tmp.path().join("state/work.json"),
        )));
        let bus = Arc::new(EventBus::new(64));
        let coordinator = StateCoordinator::new(
            Arc::clone(&repository),
            Arc::clone(&bus),
            CoordinatorConfig::default(),
        );
        coordinator.initialize().expect("initialize");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let (control_tx, _control_rx) = mpsc::channel(4);
        let deps = ServerDeps {
            session: "work".into(),
            coordinator: Arc::clone(&coordinator),
            bus,
            gate: Arc::new(PermissionGate::new(ownership)),
            repository,
            runner: Arc::new(NoTmux),
            counter: ClientCounter::default(),
            panes: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
            control_tx,
        };

        let cancel = CancellationToken::new();
        let mut config = ServerConfig::new(&socket_path);
        // Keep test teardown snappy; production uses the 5 s default.
        config.drain_timeout = Duration::from_millis(200);
        let server = IpcServer::new(config, deps, cancel.clone());
        let handle = tokio::spawn(server.run());

        Harness {
            socket_path,
            coordinator,
            shutdown_rx,
            cancel,
            server: handle,
            _tmp: tmp,
        }
    }

    fn own_ownership() -> SessionOwnership {
        SessionOwnership::capture()
    }

    fn foreign_ownership() -> SessionOwnership {
        let mut ownership = SessionOwnership::capture();
        // Pretend the daemon belongs to someone else.
        ownership.uid = ownership.uid.wrapping_add(1);
        ownership.gid = ownership.gid.wrapping_add(1);
        ownership
    }

    async fn connect(path: &PathBuf) -> Framed<UnixStream, IpcCodec> {
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return Framed::new(stream, IpcCodec::new());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not come up at {path:?}");
    }

    async fn handshake(
        client: &mut Framed<UnixStream, IpcCodec>,
        panel_id: &str,
        panel_type: &str,
    ) -> HandshakeResponseData {
        client
            .send(IpcMessage::new(
                MessageType::Handshake,
                serde_json::json!({
                    "panel_id": panel_id,
                    "panel_type": panel_type,
                    "version": "1.0",
                }),
            ))
            .await
            .expect("send handshake");
        let frame = client
            .next()
            .await
            .expect("response frame")
            .expect("decode");
        assert_eq!(frame.msg_type, MessageType::HandshakeResponse);
        serde_json::from_value(frame.data).expect("handshake response data")
    }

    #[tokio::test]
    async fn handshake_assigns_connection_id_and_pong_works() {
        let harness = start_server(own_ownership());
        let mut client = connect(&harness.socket_path).await;

        let response = handshake(&mut client, "input-1", "input").await;
        assert!(response.success);
        assert!(!response.connection_id.is_empty());

        client
            .send(
                IpcMessage::new(MessageType::Ping, serde_json::json!({}))
                    .with_request_id("p1"),
            )
            .await
            .expect("send ping");
        let frame = client.next().await.expect("pong").expect("decode");
        assert_eq!(frame.msg_type, MessageType::Pong);
        assert_eq!(frame.request_id.as_deref(), Some("p1"));

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn invalid_panel_type_is_rejected_with_auth_failed() {
        let harness = start_server(own_ownership());
        let mut client = connect(&harness.socket_path).await;

        let response = handshake(&mut client, "rogue-1", "dashboard").await;
        assert!(!response.success);

        let frame = client.next().await.expect("error frame").expect("decode");
        assert_eq!(frame.msg_type, MessageType::Error);
        assert_eq!(frame.data["code"], "AUTH_FAILED");

        // Server closes after the rejection.
        assert!(client.next().await.is_none());

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn state_update_and_request_flow() {
        let harness = start_server(own_ownership());
        let mut client = connect(&harness.socket_path).await;
        handshake(&mut client, "sessions-1", "sessions").await;

        let update = StateUpdate::new(
            1,
            "sessions-1",
            UpdatePayload::SessionAdded {
                session: SessionEntry::new("a", "Alpha"),
            },
        );
        client
            .send(
                IpcMessage::new(
                    MessageType::StateUpdate,
                    serde_json::to_value(&update).unwrap(),
                )
                .with_request_id("u1"),
            )
            .await
            .expect("send update");

        let frame = client.next().await.expect("response").expect("decode");
        assert_eq!(frame.msg_type, MessageType::StateUpdateResponse);
        let response: StateUpdateResponseData =
            serde_json::from_value(frame.data).expect("data");
        assert!(response.success);
        assert_eq!(response.version, 2);

        client
            .send(IpcMessage::new(MessageType::StateRequest, serde_json::json!({})))
            .await
            .expect("send request");
        let frame = client.next().await.expect("state").expect("decode");
        assert_eq!(frame.msg_type, MessageType::StateResponse);
        assert_eq!(frame.data["state"]["version"]["version"], 2);
        assert_eq!(frame.data["state"]["sessions"][0]["id"], "a");

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn events_fan_out_to_other_panels() {
        let harness = start_server(own_ownership());

        let mut listener = connect(&harness.socket_path).await;
        handshake(&mut listener, "messages-1", "messages").await;

        let mut writer = connect(&harness.socket_path).await;
        handshake(&mut writer, "sessions-1", "sessions").await;

        // The listener sees the writer's connect event first.
        let frame = listener.next().await.expect("event").expect("decode");
        assert_eq!(frame.msg_type, MessageType::StateEvent);
        assert_eq!(frame.data["type"], "panel_connected");

        let update = StateUpdate::new(
            1,
            "sessions-1",
            UpdatePayload::ThemeChanged { theme: "dark".into() },
        );
        writer
            .send(IpcMessage::new(
                MessageType::StateUpdate,
                serde_json::to_value(&update).unwrap(),
            ))
            .await
            .expect("send update");
        let _ = writer.next().await.expect("update response").expect("decode");

        let frame = listener.next().await.expect("event").expect("decode");
        assert_eq!(frame.msg_type, MessageType::StateEvent);
        assert_eq!(frame.data["type"], "theme_changed");
        assert_eq!(frame.data["source_panel"], "sessions-1");

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn subscribe_filters_event_types() {
        let harness = start_server(own_ownership());

        let mut listener = connect(&harness.socket_path).await;
        handshake(&mut listener, "input-1", "input").await;
        listener
            .send(IpcMessage::new(
                MessageType::Subscribe,
                serde_json::json!({
                    "event_types": ["model_changed"],
                    "panel_id": "input-1",
                }),
            ))
            .await
            .expect("subscribe");
        // Give the server a beat to apply the filter.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut writer = connect(&harness.socket_path).await;
        handshake(&mut writer, "sessions-1", "sessions").await;

        for payload in [
            UpdatePayload::ThemeChanged { theme: "dark".into() },
            UpdatePayload::ModelChanged { provider: "p".into(), model: "m".into() },
        ] {
            let version = harness.coordinator.current_version();
            writer
                .send(IpcMessage::new(
                    MessageType::StateUpdate,
                    serde_json::to_value(&StateUpdate::new(version, "sessions-1", payload))
                        .unwrap(),
                ))
                .await
                .expect("send");
            let _ = writer.next().await.expect("response").expect("decode");
        }

        // Only the model_changed event passes the filter; panel_connected
        // and theme_changed are filtered out.
        let frame = tokio::time::timeout(Duration::from_secs(2), listener.next())
            .await
            .expect("event in time")
            .expect("event")
            .expect("decode");
        assert_eq!(frame.data["type"], "model_changed");

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn shutdown_from_owner_is_acked_and_forwarded() {
        let mut harness = start_server(own_ownership());
        let mut client = connect(&harness.socket_path).await;
        handshake(&mut client, "controller-1", "controller").await;

        client
            .send(
                IpcMessage::new(
                    MessageType::Shutdown,
                    serde_json::json!({ "cleanup": true }),
                )
                .with_request_id("s1"),
            )
            .await
            .expect("send shutdown");

        let frame = client.next().await.expect("ack").expect("decode");
        assert_eq!(frame.msg_type, MessageType::Shutdown);
        assert_eq!(frame.data["success"], true);

        let request = harness.shutdown_rx.recv().await.expect("forwarded");
        assert!(request.cleanup);

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn shutdown_from_non_owner_gets_auth_failed_and_daemon_survives() {
        let mut harness = start_server(foreign_ownership());
        let mut client = connect(&harness.socket_path).await;
        handshake(&mut client, "controller-1", "controller").await;

        client
            .send(IpcMessage::new(
                MessageType::Shutdown,
                serde_json::json!({ "cleanup": false }),
            ))
            .await
            .expect("send shutdown");

        let frame = client.next().await.expect("error").expect("decode");
        assert_eq!(frame.msg_type, MessageType::Error);
        assert_eq!(frame.data["code"], "AUTH_FAILED");
        assert!(harness.shutdown_rx.try_recv().is_err(), "not forwarded");

        // Read-only surface still works for the denied peer.
        client
            .send(IpcMessage::new(MessageType::Status, serde_json::json!({})))
            .await
            .expect("send status");
        let frame = client.next().await.expect("status").expect("decode");
        assert_eq!(frame.msg_type, MessageType::Status);
        assert_eq!(frame.data["session"], "work");

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn state_mutation_from_non_owner_is_denied() {
        let harness = start_server(foreign_ownership());
        let mut client = connect(&harness.socket_path).await;
        handshake(&mut client, "sessions-1", "sessions").await;

        let update = StateUpdate::new(
            1,
            "sessions-1",
            UpdatePayload::ThemeChanged { theme: "dark".into() },
        );
        client
            .send(IpcMessage::new(
                MessageType::StateUpdate,
                serde_json::to_value(&update).unwrap(),
            ))
            .await
            .expect("send");

        let frame = client.next().await.expect("error").expect("decode");
        assert_eq!(frame.msg_type, MessageType::Error);
        assert_eq!(frame.data["code"], "AUTH_FAILED");
        assert_eq!(harness.coordinator.current_version(), 1, "state untouched");

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn list_clients_round_trip() {
        let harness = start_server(own_ownership());
        let mut client = connect(&harness.socket_path).await;
        handshake(&mut client, "controller-1", "controller").await;

        client
            .send(IpcMessage::new(MessageType::ListClients, serde_json::json!({})))
            .await
            .expect("send");
        let frame = client.next().await.expect("reply").expect("decode");
        assert_eq!(frame.msg_type, MessageType::ListClients);
        assert_eq!(frame.data["clients"][0]["tty"], "/dev/ttys001");

        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn stop_removes_socket_file() {
        let harness = start_server(own_ownership());
        // Wait for bind.
        let _ = connect(&harness.socket_path).await;
        harness.cancel.cancel();
        harness.server.await.expect("join").expect("serve");
        assert!(!harness.socket_path.exists());
    }
}
