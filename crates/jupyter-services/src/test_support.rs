//! In-memory Jupyter server for unit tests.
//!
//! [`FakeServer`] implements both [`Fetch`] and [`SocketFactory`]. It keeps
//! kernels, sessions and terminals in memory, answers the REST endpoints
//! the clients use, records every request, and hands the server end of
//! each opened socket to the test through [`FakeServer::next_socket`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jupyter_wire::{decode, encode, Channel, Frame, KernelMessage, WireProtocol};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::error::ServiceError;
use crate::kernel::KernelModel;
use crate::session::SessionModel;
use crate::settings::ServerSettings;
use crate::socket::{SocketChannel, SocketFactory};
use crate::terminal::TerminalModel;
use crate::transport::{Fetch, HttpRequest, HttpResponse};

pub(crate) const FAKE_BASE_URL: &str = "http://fake.test/";

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct FakeState {
    kernels: Vec<KernelModel>,
    sessions: Vec<SessionModel>,
    terminals: Vec<TerminalModel>,
    next_id: u32,
    requests: Vec<HttpRequest>,
    overrides: HashMap<(String, String), (u16, Value)>,
    offline: bool,
    failing_connects: u32,
    connect_count: u32,
    protocol: Option<String>,
}

impl FakeState {
    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn new_kernel(&mut self, name: &str) -> KernelModel {
        let model = KernelModel {
            id: self.new_id("kernel"),
            name: name.to_string(),
        };
        self.kernels.push(model.clone());
        model
    }

    fn kernel_for(&mut self, request: &Value) -> Option<KernelModel> {
        if let Some(id) = request.get("id").and_then(Value::as_str) {
            if let Some(existing) = self.kernels.iter().find(|k| k.id == id) {
                return Some(existing.clone());
            }
        }
        let name = request.get("name").and_then(Value::as_str)?;
        Some(self.new_kernel(name))
    }
}

/// Server end of a socket opened through the fake factory.
pub(crate) struct ServerSocket {
    pub url: Url,
    pub protocol: WireProtocol,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerSocket {
    pub fn send(&self, msg: &KernelMessage) {
        if let Ok(frame) = encode(msg, self.protocol) {
            let _ = self.to_client.send(frame);
        }
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_client.send(frame);
    }

    /// Next message from the client, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<KernelMessage> {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .ok()??;
        decode(&frame, self.protocol).ok()
    }

    /// Stop reading from the client so its writes fail while frames
    /// sent from here still arrive.
    pub fn stop_reading(&mut self) {
        let (_, closed) = mpsc::unbounded_channel();
        self.from_client = closed;
    }

    pub fn try_recv(&mut self) -> Option<KernelMessage> {
        let frame = self.from_client.try_recv().ok()?;
        decode(&frame, self.protocol).ok()
    }
}

pub(crate) struct FakeServer {
    state: Mutex<FakeState>,
    sockets_tx: mpsc::UnboundedSender<ServerSocket>,
    sockets_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSocket>>,
}

impl FakeServer {
    pub fn new() -> Self {
        init_logging();
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(FakeState::default()),
            sockets_tx,
            sockets_rx: tokio::sync::Mutex::new(sockets_rx),
        }
    }

    /// Settings whose fetch and socket factory are this server.
    pub fn settings(self: &Arc<Self>) -> ServerSettings {
        let fetch: Arc<dyn Fetch> = self.clone();
        let sockets: Arc<dyn SocketFactory> = self.clone();
        match ServerSettings::new(FAKE_BASE_URL) {
            Ok(settings) => settings.with_fetch(fetch).with_socket_factory(sockets),
            Err(e) => panic!("fake base URL rejected: {e}"),
        }
    }

    /// Answer `method path` with a fixed response from now on.
    pub fn respond(&self, method: &str, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .overrides
            .insert((method.to_string(), path.to_string()), (status, body));
    }

    pub fn clear_response(&self, method: &str, path: &str) {
        self.state
            .lock()
            .overrides
            .remove(&(method.to_string(), path.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Subprotocol to select when the client offers it.
    pub fn set_protocol(&self, protocol: Option<&str>) {
        self.state.lock().protocol = protocol.map(str::to_string);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connect_count
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.state.lock().requests.last().cloned()
    }

    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method.as_str() == method && relative_path(&r.url) == path)
            .count()
    }

    pub fn add_kernel(&self, name: &str) -> KernelModel {
        self.state.lock().new_kernel(name)
    }

    pub fn remove_kernel(&self, id: &str) {
        self.state.lock().kernels.retain(|k| k.id != id);
    }

    pub fn kernels(&self) -> Vec<KernelModel> {
        self.state.lock().kernels.clone()
    }

    pub fn add_session(&self, path: &str) -> SessionModel {
        let mut state = self.state.lock();
        let kernel = state.new_kernel("python3");
        let model = SessionModel {
            id: state.new_id("session"),
            path: path.to_string(),
            name: path.to_string(),
            kind: "notebook".to_string(),
            kernel: Some(kernel),
        };
        state.sessions.push(model.clone());
        model
    }

    pub fn remove_session(&self, id: &str) {
        self.state.lock().sessions.retain(|s| s.id != id);
    }

    pub fn sessions(&self) -> Vec<SessionModel> {
        self.state.lock().sessions.clone()
    }

    /// Server end of the next socket the client opens.
    pub async fn next_socket(&self) -> ServerSocket {
        let mut rx = self.sockets_rx.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(socket)) => socket,
            _ => panic!("no socket was opened"),
        }
    }

    fn route(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        let path = relative_path(&request.url);
        let method = request.method.as_str().to_string();
        if let Some((status, body)) = state.overrides.get(&(method.clone(), path.clone())) {
            return HttpResponse::json(*status, body);
        }

        let body: Value = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(Value::Null);
        let segments: Vec<&str> = path.split('/').collect();

        match (method.as_str(), segments.as_slice()) {
            ("GET", ["api", "kernels"]) => ok(200, &state.kernels),
            ("POST", ["api", "kernels"]) => {
                let name = body["name"].as_str().unwrap_or("python3").to_string();
                let model = state.new_kernel(&name);
                ok(201, &model)
            }
            ("GET", ["api", "kernels", id]) => match state.kernels.iter().find(|k| k.id == *id) {
                Some(model) => ok(200, model),
                None => not_found(),
            },
            ("DELETE", ["api", "kernels", id]) => {
                let before = state.kernels.len();
                state.kernels.retain(|k| k.id != *id);
                if state.kernels.len() < before {
                    HttpResponse::new(204, "")
                } else {
                    not_found()
                }
            }
            ("POST", ["api", "kernels", id, "restart"]) => {
                match state.kernels.iter().find(|k| k.id == *id) {
                    Some(model) => ok(200, model),
                    None => not_found(),
                }
            }
            ("POST", ["api", "kernels", id, "interrupt"]) => {
                if state.kernels.iter().any(|k| k.id == *id) {
                    HttpResponse::new(204, "")
                } else {
                    not_found()
                }
            }
            ("GET", ["api", "kernelspecs"]) => HttpResponse::json(200, &kernelspecs_body()),
            ("GET", ["api", "sessions"]) => ok(200, &state.sessions),
            ("POST", ["api", "sessions"]) => {
                let path = body["path"].as_str().unwrap_or_default().to_string();
                if let Some(existing) = state.sessions.iter().find(|s| s.path == path) {
                    return ok(201, existing);
                }
                // A server starts the default kernelspec when none is named.
                let kernel = match body.get("kernel") {
                    Some(request) if request.is_object() => state.kernel_for(request),
                    _ => Some(state.new_kernel("python3")),
                };
                let model = SessionModel {
                    id: state.new_id("session"),
                    path,
                    name: body["name"].as_str().unwrap_or_default().to_string(),
                    kind: body["type"].as_str().unwrap_or("notebook").to_string(),
                    kernel,
                };
                state.sessions.push(model.clone());
                ok(201, &model)
            }
            ("GET", ["api", "sessions", id]) => match state.sessions.iter().find(|s| s.id == *id) {
                Some(model) => ok(200, model),
                None => not_found(),
            },
            ("PATCH", ["api", "sessions", id]) => {
                let Some(index) = state.sessions.iter().position(|s| s.id == *id) else {
                    return not_found();
                };
                let kernel = match body.get("kernel") {
                    Some(request) if request.is_object() => state.kernel_for(request),
                    _ => state.sessions[index].kernel.clone(),
                };
                let session = &mut state.sessions[index];
                if let Some(path) = body["path"].as_str() {
                    session.path = path.to_string();
                }
                if let Some(name) = body["name"].as_str() {
                    session.name = name.to_string();
                }
                if let Some(kind) = body["type"].as_str() {
                    session.kind = kind.to_string();
                }
                session.kernel = kernel;
                let model = session.clone();
                ok(200, &model)
            }
            ("DELETE", ["api", "sessions", id]) => {
                let Some(index) = state.sessions.iter().position(|s| s.id == *id) else {
                    return not_found();
                };
                let session = state.sessions.remove(index);
                if let Some(kernel) = session.kernel {
                    state.kernels.retain(|k| k.id != kernel.id);
                }
                HttpResponse::new(204, "")
            }
            ("GET", ["api", "terminals"]) => ok(200, &state.terminals),
            ("POST", ["api", "terminals"]) => {
                let model = TerminalModel {
                    name: state.new_id("term"),
                };
                state.terminals.push(model.clone());
                ok(200, &model)
            }
            ("GET", ["api", "terminals", name]) => {
                match state.terminals.iter().find(|t| t.name == *name) {
                    Some(model) => ok(200, model),
                    None => not_found(),
                }
            }
            ("DELETE", ["api", "terminals", name]) => {
                let before = state.terminals.len();
                state.terminals.retain(|t| t.name != *name);
                if state.terminals.len() < before {
                    HttpResponse::new(204, "")
                } else {
                    not_found()
                }
            }
            _ => not_found(),
        }
    }
}

#[async_trait]
impl Fetch for FakeServer {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError> {
        if self.state.lock().offline {
            return Err(ServiceError::Network("connection refused".into()));
        }
        Ok(self.route(&request))
    }
}

#[async_trait]
impl SocketFactory for FakeServer {
    async fn connect(
        &self,
        url: &Url,
        protocols: &[&str],
        _headers: &[(String, String)],
    ) -> Result<SocketChannel, ServiceError> {
        let selected = {
            let mut state = self.state.lock();
            state.connect_count += 1;
            if state.offline || state.failing_connects > 0 {
                state.failing_connects = state.failing_connects.saturating_sub(1);
                return Err(ServiceError::Network("connection refused".into()));
            }
            state
                .protocol
                .clone()
                .filter(|p| protocols.contains(&p.as_str()))
        };

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let _ = self.sockets_tx.send(ServerSocket {
            url: url.clone(),
            protocol: WireProtocol::from_subprotocol(selected.as_deref()),
            to_client,
            from_client,
        });

        Ok(SocketChannel {
            protocol: selected,
            outgoing,
            incoming,
        })
    }
}

fn relative_path(url: &Url) -> String {
    url.path().trim_start_matches('/').to_string()
}

fn ok<T: Serialize + ?Sized>(status: u16, value: &T) -> HttpResponse {
    match serde_json::to_value(value) {
        Ok(body) => HttpResponse::json(status, &body),
        Err(e) => HttpResponse::json(500, &json!({"message": e.to_string()})),
    }
}

fn not_found() -> HttpResponse {
    HttpResponse::json(404, &json!({"message": "Not found"}))
}

fn kernelspecs_body() -> Value {
    json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "spec": {
                    "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                    "env": {},
                    "display_name": "Python 3",
                    "language": "python",
                    "interrupt_mode": "signal",
                    "metadata": {"debugger": true}
                },
                "resources": {}
            }
        }
    })
}

/// A message as the kernel would send it.
pub(crate) fn kernel_msg(
    channel: Channel,
    msg_type: &str,
    content: Value,
    parent: Option<&KernelMessage>,
) -> KernelMessage {
    let msg = KernelMessage::new(
        channel,
        msg_type,
        uuid::Uuid::new_v4().to_string(),
        "kernel-session",
        "kernel",
        content,
    );
    match parent {
        Some(parent) => msg.with_parent(parent),
        None => msg,
    }
}

pub(crate) fn status_msg(state: &str, parent: Option<&KernelMessage>) -> KernelMessage {
    kernel_msg(
        Channel::Iopub,
        "status",
        json!({"execution_state": state}),
        parent,
    )
}

/// The `*_reply` for a `*_request`, on the request's channel.
pub(crate) fn reply_msg(request: &KernelMessage, content: Value) -> KernelMessage {
    let msg_type = request.msg_type().replace("_request", "_reply");
    kernel_msg(
        request.channel.unwrap_or(Channel::Shell),
        &msg_type,
        content,
        Some(request),
    )
}
