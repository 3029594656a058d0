//! A live connection to one kernel over its channels WebSocket.
//!
//! A [`KernelConnection`] is a cheap handle around shared state plus one
//! background task that owns the socket loop:
//!
//! ```text
//! connecting --open--> connected --close--> disconnected --backoff--> connecting
//!                                                  |
//!                                   attempts exhausted: status dead
//! ```
//!
//! Inbound messages are dispatched in receive order: to the reply future
//! whose request is the message's parent, to comms by `comm_id`, and
//! otherwise to the `iopub_message` broadcast. Outbound messages sent while
//! the socket is down are queued and flushed in order on reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use jupyter_wire::{
    decode, encode, Channel, Frame, KernelMessage, WireProtocol, KERNEL_WEBSOCKET_PROTOCOL_V1,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};

use super::comm::{Comm, CommEvent, CommRoute, IncomingComm};
use super::future::{KernelFuture, PendingReply};
use super::{restapi, ConnectionStatus, KernelModel, KernelStatus};
use crate::error::ServiceError;
use crate::settings::ServerSettings;
use crate::signal::{Signal, DEFAULT_SIGNAL_CAPACITY};

/// Backoff for re-opening a dropped socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts after a drop before the kernel is declared dead.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct KernelConnectionOptions {
    /// Session id stamped on message headers; random when absent.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// How long `restart` waits for the kernel to report `starting`.
    pub restart_timeout: Duration,
    /// Messages buffered per `iopub_message`/`any_message` subscriber.
    /// A subscriber that falls further behind gets `Lagged` and loses the
    /// oldest messages.
    pub message_capacity: usize,
}

impl Default for KernelConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            reconnect: ReconnectPolicy::default(),
            restart_timeout: Duration::from_secs(30),
            message_capacity: DEFAULT_SIGNAL_CAPACITY,
        }
    }
}

/// Content of an `execute_request`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Value,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecuteOptions {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: json!({}),
            allow_stdin: true,
            stop_on_error: false,
        }
    }

    fn to_content(&self) -> Value {
        json!({
            "code": self.code,
            "silent": self.silent,
            "store_history": self.store_history,
            "user_expressions": self.user_expressions,
            "allow_stdin": self.allow_stdin,
            "stop_on_error": self.stop_on_error,
        })
    }
}

struct ActiveSocket {
    outgoing: mpsc::UnboundedSender<Frame>,
    protocol: WireProtocol,
}

struct ConnState {
    status: KernelStatus,
    connection_status: ConnectionStatus,
    disposed: bool,
    socket: Option<ActiveSocket>,
    queued: VecDeque<KernelMessage>,
    futures: HashMap<String, PendingReply>,
    comms: HashMap<String, CommRoute>,
    comm_targets: HashMap<String, mpsc::UnboundedSender<IncomingComm>>,
}

pub(crate) struct Inner {
    model: KernelModel,
    client_id: String,
    username: String,
    settings: Arc<ServerSettings>,
    options: KernelConnectionOptions,
    msg_counter: AtomicU64,
    state: Mutex<ConnState>,
    status_changed: Signal<KernelStatus>,
    connection_status_changed: Signal<ConnectionStatus>,
    iopub_message: Signal<KernelMessage>,
    any_message: Signal<KernelMessage>,
    disposed: Signal<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to a live kernel connection. Clones share the same connection.
#[derive(Clone)]
pub struct KernelConnection {
    inner: Arc<Inner>,
}

/// Non-owning handle held by comms.
#[derive(Clone)]
pub(crate) struct WeakKernelConnection(Weak<Inner>);

impl WeakKernelConnection {
    pub(crate) fn upgrade(&self) -> Option<KernelConnection> {
        self.0.upgrade().map(|inner| KernelConnection { inner })
    }
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnection")
            .field("id", &self.inner.model.id)
            .field("name", &self.inner.model.name)
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive()
    }
}

impl KernelConnection {
    /// Connect to an existing kernel. Must be called inside a tokio runtime;
    /// the socket is opened in the background.
    pub fn connect(
        settings: Arc<ServerSettings>,
        model: KernelModel,
        options: KernelConnectionOptions,
    ) -> Self {
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let username = options.username.clone().unwrap_or_default();
        let message_capacity = options.message_capacity.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            model,
            client_id,
            username,
            settings,
            options,
            msg_counter: AtomicU64::new(0),
            state: Mutex::new(ConnState {
                status: KernelStatus::Unknown,
                connection_status: ConnectionStatus::Connecting,
                disposed: false,
                socket: None,
                queued: VecDeque::new(),
                futures: HashMap::new(),
                comms: HashMap::new(),
                comm_targets: HashMap::new(),
            }),
            status_changed: Signal::new(),
            connection_status_changed: Signal::new(),
            iopub_message: Signal::with_capacity(message_capacity),
            any_message: Signal::with_capacity(message_capacity),
            disposed: Signal::new(),
            shutdown_tx,
        });

        info!(
            "[kernel-connection] Connecting to kernel {} ({})",
            inner.model.id, inner.model.name
        );
        tokio::spawn(run_socket_loop(Arc::downgrade(&inner), shutdown_rx));
        KernelConnection { inner }
    }

    /// A new, independent connection to the same kernel with its own socket
    /// and message-id space.
    pub fn clone_connection(&self) -> KernelConnection {
        KernelConnection::connect(
            self.inner.settings.clone(),
            self.inner.model.clone(),
            KernelConnectionOptions {
                client_id: None,
                username: Some(self.inner.username.clone()),
                ..self.inner.options.clone()
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.model.id
    }

    pub fn name(&self) -> &str {
        &self.inner.model.name
    }

    pub fn model(&self) -> KernelModel {
        self.inner.model.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn status(&self) -> KernelStatus {
        self.inner.state.lock().status
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().connection_status
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Number of requests still waiting for completion.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().futures.len()
    }

    pub fn has_comm(&self, comm_id: &str) -> bool {
        self.inner.state.lock().comms.contains_key(comm_id)
    }

    pub fn status_changed(&self) -> broadcast::Receiver<KernelStatus> {
        self.inner.status_changed.subscribe()
    }

    pub fn connection_status_changed(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.connection_status_changed.subscribe()
    }

    /// Messages not claimed by a pending request or a comm.
    ///
    /// Buffers up to [`KernelConnectionOptions::message_capacity`] messages
    /// per receiver; a slower receiver sees `RecvError::Lagged` and skips
    /// the oldest ones.
    pub fn iopub_message(&self) -> broadcast::Receiver<KernelMessage> {
        self.inner.iopub_message.subscribe()
    }

    /// Every inbound message, before dispatch.
    pub fn any_message(&self) -> broadcast::Receiver<KernelMessage> {
        self.inner.any_message.subscribe()
    }

    pub fn disposed(&self) -> broadcast::Receiver<()> {
        self.inner.disposed.subscribe()
    }

    /// Build a message from this client with a fresh, never reused `msg_id`.
    pub fn new_message(&self, channel: Channel, msg_type: &str, content: Value) -> KernelMessage {
        let n = self.inner.msg_counter.fetch_add(1, Ordering::Relaxed);
        let msg_id = format!("{}_{}", self.inner.client_id, n);
        KernelMessage::new(
            channel,
            msg_type,
            msg_id,
            &self.inner.client_id,
            &self.inner.username,
            content,
        )
    }

    /// Send a message and track its replies.
    ///
    /// `expect_reply` is false for messages that get no shell reply (comm
    /// messages); such futures complete on the matching `idle` status.
    pub fn send_message(
        &self,
        msg: KernelMessage,
        expect_reply: bool,
    ) -> Result<KernelFuture, ServiceError> {
        let msg_id = msg.msg_id().to_string();
        let mut state = self.inner.state.lock();
        ensure_open(&state)?;
        if state.futures.contains_key(&msg_id) {
            return Err(ServiceError::InvalidState(format!(
                "a request with msg_id {} is already pending",
                msg_id
            )));
        }
        let (pending, future) = PendingReply::new(msg_id.clone(), expect_reply);
        transmit(&mut state, msg)?;
        state.futures.insert(msg_id, pending);
        Ok(future)
    }

    /// Send a message without tracking any reply.
    pub fn send_raw(&self, msg: KernelMessage) -> Result<(), ServiceError> {
        let mut state = self.inner.state.lock();
        ensure_open(&state)?;
        transmit(&mut state, msg)
    }

    fn request(&self, channel: Channel, msg_type: &str, content: Value) -> Result<KernelFuture, ServiceError> {
        let msg = self.new_message(channel, msg_type, content);
        self.send_message(msg, true)
    }

    pub fn request_kernel_info(&self) -> Result<KernelFuture, ServiceError> {
        self.request(Channel::Shell, "kernel_info_request", json!({}))
    }

    pub fn request_execute(&self, options: &ExecuteOptions) -> Result<KernelFuture, ServiceError> {
        self.request(Channel::Shell, "execute_request", options.to_content())
    }

    pub fn request_complete(&self, code: &str, cursor_pos: usize) -> Result<KernelFuture, ServiceError> {
        self.request(
            Channel::Shell,
            "complete_request",
            json!({"code": code, "cursor_pos": cursor_pos}),
        )
    }

    pub fn request_inspect(
        &self,
        code: &str,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<KernelFuture, ServiceError> {
        self.request(
            Channel::Shell,
            "inspect_request",
            json!({"code": code, "cursor_pos": cursor_pos, "detail_level": detail_level}),
        )
    }

    /// `content` follows the `history_request` schema (`hist_access_type`,
    /// `output`, `raw`, ...).
    pub fn request_history(&self, content: Value) -> Result<KernelFuture, ServiceError> {
        self.request(Channel::Shell, "history_request", content)
    }

    pub fn request_is_complete(&self, code: &str) -> Result<KernelFuture, ServiceError> {
        self.request(Channel::Shell, "is_complete_request", json!({"code": code}))
    }

    pub fn request_comm_info(&self, target_name: Option<&str>) -> Result<KernelFuture, ServiceError> {
        let content = match target_name {
            Some(target) => json!({"target_name": target}),
            None => json!({}),
        };
        self.request(Channel::Shell, "comm_info_request", content)
    }

    /// Answer an `input_request` on stdin.
    pub fn send_input_reply(
        &self,
        value: &str,
        parent: Option<&KernelMessage>,
    ) -> Result<(), ServiceError> {
        let mut msg = self.new_message(
            Channel::Stdin,
            "input_reply",
            json!({"status": "ok", "value": value}),
        );
        if let Some(parent) = parent {
            msg = msg.with_parent(parent);
        }
        self.send_raw(msg)
    }

    /// Route inbound `comm_open`s for `target_name` to the returned receiver.
    pub fn register_comm_target(
        &self,
        target_name: &str,
    ) -> Result<mpsc::UnboundedReceiver<IncomingComm>, ServiceError> {
        let mut state = self.inner.state.lock();
        ensure_open(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.comm_targets.insert(target_name.to_string(), tx);
        Ok(rx)
    }

    pub fn remove_comm_target(&self, target_name: &str) {
        self.inner.state.lock().comm_targets.remove(target_name);
    }

    /// Create a comm from this side. Call [`Comm::open`] to announce it.
    pub fn create_comm(&self, target_name: &str, comm_id: Option<String>) -> Result<Comm, ServiceError> {
        let comm_id = comm_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut state = self.inner.state.lock();
        ensure_open(&state)?;
        if state.comms.contains_key(&comm_id) {
            return Err(ServiceError::InvalidState(format!(
                "comm {} already exists",
                comm_id
            )));
        }
        let (comm, route) = Comm::new(&comm_id, target_name, self.downgrade());
        state.comms.insert(comm_id, route);
        Ok(comm)
    }

    pub(crate) fn unregister_comm(&self, comm_id: &str) {
        let route = self.inner.state.lock().comms.remove(comm_id);
        drop(route);
    }

    pub(crate) fn downgrade(&self) -> WeakKernelConnection {
        WeakKernelConnection(Arc::downgrade(&self.inner))
    }

    /// Interrupt the kernel through the REST API.
    pub async fn interrupt(&self) -> Result<(), ServiceError> {
        self.ensure_alive()?;
        restapi::interrupt_kernel(&self.inner.settings, self.id()).await
    }

    /// Restart the kernel through the REST API and wait until it reports
    /// `starting` again. Pending requests are rejected and comms dropped.
    pub async fn restart(&self) -> Result<(), ServiceError> {
        self.ensure_alive()?;
        let mut status_rx = self.inner.status_changed.subscribe();
        let mut disposed_rx = self.inner.disposed.subscribe();

        restapi::restart_kernel(&self.inner.settings, self.id()).await?;
        if self.is_disposed() {
            return Err(ServiceError::Disposed);
        }
        self.inner.set_status(KernelStatus::Restarting);
        self.inner.clear_kernel_state(ServiceError::Disposed);

        let wait = async {
            loop {
                tokio::select! {
                    status = status_rx.recv() => match status {
                        Ok(KernelStatus::Starting) => return Ok(()),
                        Ok(KernelStatus::Dead) => return Err(ServiceError::KernelDead),
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return Err(ServiceError::Disposed),
                    },
                    _ = disposed_rx.recv() => return Err(ServiceError::Disposed),
                }
            }
        };
        match tokio::time::timeout(self.inner.options.restart_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout("kernel restart".into())),
        }
    }

    /// Shut the kernel down through the REST API, then dispose.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        if self.is_disposed() {
            return Err(ServiceError::ConnectionClosed(
                "kernel connection is disposed".into(),
            ));
        }
        if self.status() != KernelStatus::Dead {
            restapi::shutdown_kernel(&self.inner.settings, self.id()).await?;
        }
        self.inner.set_status(KernelStatus::Dead);
        self.dispose();
        Ok(())
    }

    /// Close the socket, reject pending requests with
    /// [`ServiceError::Disposed`] and drop comms. Idempotent.
    pub fn dispose(&self) {
        let (futures, comms) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.socket = None;
            state.queued.clear();
            state.comm_targets.clear();
            (
                std::mem::take(&mut state.futures),
                std::mem::take(&mut state.comms),
            )
        };

        debug!(
            "[kernel-connection] Disposing connection {} to kernel {} ({} pending)",
            self.inner.client_id,
            self.inner.model.id,
            futures.len()
        );
        for (_, pending) in futures {
            pending.reject(ServiceError::Disposed);
        }
        drop(comms);

        let _ = self.inner.shutdown_tx.send(true);
        self.inner.disposed.emit(());
    }

    fn ensure_alive(&self) -> Result<(), ServiceError> {
        ensure_open(&self.inner.state.lock())
    }
}

fn ensure_open(state: &ConnState) -> Result<(), ServiceError> {
    if state.disposed {
        return Err(ServiceError::ConnectionClosed(
            "kernel connection is disposed".into(),
        ));
    }
    if state.status == KernelStatus::Dead {
        return Err(ServiceError::KernelDead);
    }
    Ok(())
}

/// Write to the socket if one is open, otherwise queue for the next open.
fn transmit(state: &mut ConnState, msg: KernelMessage) -> Result<(), ServiceError> {
    if let Some(socket) = &state.socket {
        let frame = encode(&msg, socket.protocol)?;
        if socket.outgoing.send(frame).is_ok() {
            return Ok(());
        }
        state.socket = None;
    }
    state.queued.push_back(msg);
    Ok(())
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn set_status(&self, status: KernelStatus) {
        let changed = {
            let mut state = self.state.lock();
            if state.disposed || state.status == status {
                false
            } else {
                state.status = status;
                true
            }
        };
        if !changed {
            return;
        }
        debug!("[kernel-connection] Kernel {} status: {}", self.model.id, status);
        match status {
            KernelStatus::Dead => self.clear_kernel_state(ServiceError::KernelDead),
            KernelStatus::AutoRestarting => self.clear_kernel_state(ServiceError::Disposed),
            _ => {}
        }
        self.status_changed.emit(status);
    }

    fn set_connection_status(&self, status: ConnectionStatus) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.connection_status == status {
                return;
            }
            state.connection_status = status;
        }
        debug!(
            "[kernel-connection] Kernel {} connection: {}",
            self.model.id, status
        );
        self.connection_status_changed.emit(status);
    }

    /// Reject pending requests with `err`, drop comms and queued messages.
    fn clear_kernel_state(&self, err: ServiceError) {
        let (futures, comms) = {
            let mut state = self.state.lock();
            state.queued.clear();
            (
                std::mem::take(&mut state.futures),
                std::mem::take(&mut state.comms),
            )
        };
        for (_, pending) in futures {
            pending.reject(err.clone());
        }
        drop(comms);
    }

    /// Open a socket, install it and flush queued messages in order.
    /// Returns the read side with the protocol negotiated for it.
    async fn open_socket(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<Frame>, WireProtocol), ServiceError> {
        let url = self
            .settings
            .kernel_channels_url(&self.model.id, &self.client_id)?;
        let channel = self
            .settings
            .socket_factory
            .connect(
                &url,
                &[KERNEL_WEBSOCKET_PROTOCOL_V1],
                &self.settings.request_headers(),
            )
            .await?;
        let protocol = WireProtocol::from_subprotocol(channel.protocol.as_deref());

        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(ServiceError::Disposed);
            }
            while let Some(msg) = state.queued.pop_front() {
                match encode(&msg, protocol) {
                    Ok(frame) => {
                        if channel.outgoing.send(frame).is_err() {
                            state.queued.push_front(msg);
                            return Err(ServiceError::ConnectionClosed(
                                "socket closed while flushing".into(),
                            ));
                        }
                    }
                    Err(e) => warn!("[kernel-connection] Dropping unencodable message: {}", e),
                }
            }
            state.socket = Some(ActiveSocket {
                outgoing: channel.outgoing,
                protocol,
            });
        }

        info!(
            "[kernel-connection] Connected to kernel {} ({:?})",
            self.model.id, protocol
        );
        self.set_connection_status(ConnectionStatus::Connected);
        Ok((channel.incoming, protocol))
    }

    fn on_socket_closed(&self) {
        self.state.lock().socket = None;
        self.set_connection_status(ConnectionStatus::Disconnected);
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame, protocol: WireProtocol) {
        match decode(&frame, protocol) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => warn!("[kernel-connection] Dropping invalid message: {}", e),
        }
    }

    fn dispatch(self: &Arc<Self>, msg: KernelMessage) {
        if self.is_disposed() {
            return;
        }
        self.any_message.emit(msg.clone());

        if msg.channel == Some(Channel::Iopub) {
            if let Some(status) = msg.execution_state().and_then(KernelStatus::from_execution_state) {
                self.set_status(status);
            }
        }

        let mut handled = false;
        if let Some(parent_id) = msg.parent_msg_id() {
            handled = self.deliver_to_future(parent_id, &msg);
        }
        if msg.is_comm_message() {
            self.route_comm(&msg);
            handled = true;
        }
        if !handled {
            self.iopub_message.emit(msg);
        }
    }

    fn deliver_to_future(&self, parent_id: &str, msg: &KernelMessage) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.futures.get_mut(parent_id) else {
            return false;
        };
        pending.handle(msg);
        if pending.is_done() {
            if let Some(pending) = state.futures.remove(parent_id) {
                pending.finish();
            }
        }
        true
    }

    fn route_comm(self: &Arc<Self>, msg: &KernelMessage) {
        let Some(comm_id) = msg.comm_id() else {
            return;
        };
        match msg.msg_type() {
            "comm_open" => self.handle_comm_open(comm_id, msg),
            "comm_msg" => {
                let state = self.state.lock();
                match state.comms.get(comm_id) {
                    Some(route) => route.deliver(CommEvent::Message(msg.clone())),
                    None => debug!("[kernel-connection] comm_msg for unknown comm {}", comm_id),
                }
            }
            _ => {
                let route = self.state.lock().comms.remove(comm_id);
                if let Some(route) = route {
                    route.deliver(CommEvent::Close(msg.clone()));
                }
            }
        }
    }

    fn handle_comm_open(self: &Arc<Self>, comm_id: &str, msg: &KernelMessage) {
        let target_name = msg
            .content
            .get("target_name")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut state = self.state.lock();
        if state.comms.contains_key(comm_id) {
            warn!("[kernel-connection] Comm {} is already open", comm_id);
            return;
        }
        let Some(target) = state.comm_targets.get(target_name).cloned() else {
            drop(state);
            warn!(
                "[kernel-connection] No comm target registered for {:?}, closing comm {}",
                target_name, comm_id
            );
            self.reject_comm(comm_id, msg);
            return;
        };

        let (comm, route) = Comm::new(comm_id, target_name, WeakKernelConnection(Arc::downgrade(self)));
        state.comms.insert(comm_id.to_string(), route);
        drop(state);

        let incoming = IncomingComm {
            comm,
            open_msg: msg.clone(),
        };
        if let Err(rejected) = target.send(incoming) {
            drop(rejected);
            warn!(
                "[kernel-connection] Comm target {:?} is gone, closing comm {}",
                target_name, comm_id
            );
            self.state.lock().comm_targets.remove(target_name);
            self.reject_comm(comm_id, msg);
        }
    }

    /// Tell the kernel we will not handle a comm it opened.
    fn reject_comm(self: &Arc<Self>, comm_id: &str, open_msg: &KernelMessage) {
        let connection = KernelConnection {
            inner: self.clone(),
        };
        let close = connection
            .new_message(Channel::Shell, "comm_close", json!({"comm_id": comm_id, "data": {}}))
            .with_parent(open_msg);
        if let Err(e) = connection.send_raw(close) {
            debug!("[kernel-connection] Could not close comm {}: {}", comm_id, e);
        }
    }
}

/// Socket lifetime loop: connect, read until close, back off, repeat.
///
/// Holds only a weak reference between events so that dropping every
/// handle ends the loop.
async fn run_socket_loop(weak: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.is_disposed() {
            return;
        }
        inner.set_connection_status(ConnectionStatus::Connecting);

        let opened = tokio::select! {
            result = inner.open_socket() => result,
            _ = shutdown.changed() => return,
        };
        let incoming = match opened {
            Ok(opened) => {
                attempt = 0;
                Some(opened)
            }
            Err(ServiceError::Disposed) => return,
            Err(e) => {
                warn!(
                    "[kernel-connection] Could not connect to kernel {}: {}",
                    inner.model.id, e
                );
                None
            }
        };
        drop(inner);

        if let Some((mut incoming, protocol)) = incoming {
            loop {
                tokio::select! {
                    frame = incoming.recv() => match frame {
                        Some(frame) => match weak.upgrade() {
                            Some(inner) => inner.handle_frame(frame, protocol),
                            None => return,
                        },
                        None => break,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.is_disposed() {
            return;
        }
        inner.on_socket_closed();

        attempt += 1;
        if attempt > inner.options.reconnect.max_attempts {
            error!(
                "[kernel-connection] Giving up on kernel {} after {} reconnect attempts",
                inner.model.id, inner.options.reconnect.max_attempts
            );
            inner.set_status(KernelStatus::Dead);
            return;
        }
        let delay = inner.options.reconnect.delay_for(attempt);
        info!(
            "[kernel-connection] Reconnecting to kernel {} in {:?} (attempt {}/{})",
            inner.model.id, delay, attempt, inner.options.reconnect.max_attempts
        );
        drop(inner);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}
