//! End-to-end tests against a small in-process Jupyter server.
//!
//! The REST side is a hyper server; kernel channels are served by a
//! tokio-tungstenite listener that answers like a kernel would.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::header::{HeaderValue as HttpHeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use jupyter_services::{
    ConnectionStatus, ExecuteOptions, KernelManager, KernelModel, KernelOptions, ManagerOptions,
    PollOptions, ServerSettings, ServiceError,
};
use jupyter_wire::{
    decode, encode, Channel, Frame, KernelMessage, WireProtocol, KERNEL_WEBSOCKET_PROTOCOL_V1,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "secret";

#[derive(Default)]
struct ServerState {
    kernels: Mutex<Vec<KernelModel>>,
    selected_protocols: Mutex<Vec<Option<String>>>,
}

struct TestServer {
    state: Arc<ServerState>,
    rest_url: String,
    ws_url: String,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let state = Arc::new(ServerState::default());

        let rest = TcpListener::bind("127.0.0.1:0").await?;
        let rest_url = format!("http://{}/", rest.local_addr()?);
        let rest_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = rest.accept().await {
                let state = rest_state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle_rest(req, state.clone()));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        let ws = TcpListener::bind("127.0.0.1:0").await?;
        let ws_url = format!("ws://{}/", ws.local_addr()?);
        let ws_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = ws.accept().await {
                tokio::spawn(serve_kernel(stream, ws_state.clone()));
            }
        });

        Ok(TestServer {
            state,
            rest_url,
            ws_url,
        })
    }

    fn settings(&self, token: &str) -> anyhow::Result<Arc<ServerSettings>> {
        let settings = ServerSettings::new(&self.rest_url)?
            .with_ws_url(&self.ws_url)?
            .with_token(token);
        Ok(Arc::new(settings))
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HttpHeaderValue::from_static("application/json"));
    response
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

async fn handle_rest(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let expected = format!("token {TOKEN}");
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    if !authorized {
        return Ok(json_response(
            StatusCode::FORBIDDEN,
            &json!({"message": "Forbidden"}),
        ));
    }

    let method = req.method().as_str().to_string();
    let path = req.uri().path().trim_start_matches('/').to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();

    let response = match (method.as_str(), segments.as_slice()) {
        ("GET", ["api", "kernels"]) => {
            json_response(StatusCode::OK, &json!(*state.kernels.lock()))
        }
        ("POST", ["api", "kernels"]) => {
            let model = KernelModel {
                id: uuid::Uuid::new_v4().to_string(),
                name: body["name"].as_str().unwrap_or("python3").to_string(),
            };
            state.kernels.lock().push(model.clone());
            json_response(StatusCode::CREATED, &json!(model))
        }
        ("DELETE", ["api", "kernels", id]) => {
            let mut kernels = state.kernels.lock();
            let before = kernels.len();
            kernels.retain(|k| k.id != *id);
            if kernels.len() < before {
                empty_response(StatusCode::NO_CONTENT)
            } else {
                json_response(StatusCode::NOT_FOUND, &json!({"message": "No such kernel"}))
            }
        }
        ("POST", ["api", "kernels", _, "interrupt"]) => empty_response(StatusCode::NO_CONTENT),
        ("GET", ["api", "kernelspecs"]) => json_response(
            StatusCode::OK,
            &json!({
                "default": "python3",
                "kernelspecs": {
                    "python3": {
                        "name": "python3",
                        "spec": {
                            "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                            "display_name": "Python 3",
                            "language": "python",
                            "env": {},
                            "metadata": {}
                        },
                        "resources": {}
                    }
                }
            }),
        ),
        _ => json_response(StatusCode::NOT_FOUND, &json!({"message": "Not found"})),
    };
    Ok(response)
}

/// Accept one kernel socket, select the v1 subprotocol when offered, and
/// answer `execute_request`s.
async fn serve_kernel(stream: TcpStream, state: Arc<ServerState>) {
    let mut selected: Option<String> = None;
    let callback = |req: &WsRequest, mut response: WsResponse| {
        let offered = req
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if offered
            .split(',')
            .any(|p| p.trim() == KERNEL_WEBSOCKET_PROTOCOL_V1)
        {
            response.headers_mut().insert(
                "sec-websocket-protocol",
                HeaderValue::from_static(KERNEL_WEBSOCKET_PROTOCOL_V1),
            );
            selected = Some(KERNEL_WEBSOCKET_PROTOCOL_V1.to_string());
        }
        Ok::<_, ErrorResponse>(response)
    };
    let Ok(mut socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let protocol = WireProtocol::from_subprotocol(selected.as_deref());
    state.selected_protocols.lock().push(selected);

    while let Some(Ok(message)) = socket.next().await {
        let frame = match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(Bytes::from(data)),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(request) = decode(&frame, protocol) else {
            continue;
        };
        for reply in kernel_replies(&request) {
            let Ok(frame) = encode(&reply, protocol) else {
                continue;
            };
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data.to_vec()),
            };
            if socket.send(message).await.is_err() {
                return;
            }
        }
    }
}

fn kernel_message(
    channel: Channel,
    msg_type: &str,
    content: Value,
    parent: &KernelMessage,
) -> KernelMessage {
    KernelMessage::new(
        channel,
        msg_type,
        uuid::Uuid::new_v4().to_string(),
        "kernel",
        "kernel",
        content,
    )
    .with_parent(parent)
}

fn kernel_replies(request: &KernelMessage) -> Vec<KernelMessage> {
    let status = |state: &str| {
        kernel_message(
            Channel::Iopub,
            "status",
            json!({"execution_state": state}),
            request,
        )
    };
    match request.msg_type() {
        "execute_request" => {
            let code = request.content["code"].as_str().unwrap_or_default();
            vec![
                status("busy"),
                kernel_message(
                    Channel::Iopub,
                    "stream",
                    json!({"name": "stdout", "text": code}),
                    request,
                ),
                kernel_message(
                    Channel::Shell,
                    "execute_reply",
                    json!({"status": "ok", "execution_count": 1}),
                    request,
                ),
                status("idle"),
            ]
        }
        "kernel_info_request" => vec![
            status("busy"),
            kernel_message(
                Channel::Shell,
                "kernel_info_reply",
                json!({"status": "ok", "protocol_version": "5.3", "implementation": "test"}),
                request,
            ),
            status("idle"),
        ],
        _ => Vec::new(),
    }
}

async fn wait_connected(connection: &jupyter_services::KernelConnection) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while connection.connection_status() != ConnectionStatus::Connected {
        assert!(tokio::time::Instant::now() < deadline, "socket never connected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_execute_round_trip() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let manager = KernelManager::new(
        server.settings(TOKEN)?,
        ManagerOptions::default().with_poll(PollOptions::disabled()),
    );
    manager.ready().await?;
    assert_eq!(manager.specs().map(|s| s.default), Some("python3".to_string()));

    let connection = manager.start_new(&KernelOptions::named("python3")).await?;
    assert_eq!(manager.running().len(), 1);

    let mut future = connection.request_execute(&ExecuteOptions::new("print('hi')"))?;
    let reply = tokio::time::timeout(Duration::from_secs(10), async {
        let mut streamed = Vec::new();
        while let Some(msg) = future.next_message().await {
            streamed.push(msg.msg_type().to_string());
        }
        (streamed, future.done().await)
    })
    .await?;

    let (streamed, done) = reply;
    assert_eq!(streamed, ["status", "stream", "execute_reply", "status"]);
    let reply = done?.expect("execute_reply");
    assert_eq!(reply.content["status"], "ok");

    assert_eq!(
        server.state.selected_protocols.lock().as_slice(),
        [Some(KERNEL_WEBSOCKET_PROTOCOL_V1.to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn test_kernel_info_and_shutdown() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let manager = KernelManager::new(
        server.settings(TOKEN)?,
        ManagerOptions::default().with_poll(PollOptions::disabled()),
    );
    manager.ready().await?;

    let connection = manager.start_new(&KernelOptions::default()).await?;
    wait_connected(&connection).await;

    let info = tokio::time::timeout(Duration::from_secs(10), connection.request_kernel_info()?.done())
        .await??
        .expect("kernel_info_reply");
    assert_eq!(info.content["implementation"], "test");

    connection.interrupt().await?;

    let mut running = manager.running_changed();
    manager.shutdown(connection.id()).await?;
    assert!(running.try_recv()?.is_empty());
    assert!(connection.is_disposed());
    assert!(server.state.kernels.lock().is_empty());

    // Deleting again is tolerated by the REST client.
    jupyter_services::kernel::restapi::shutdown_kernel(manager.settings(), "gone").await?;
    Ok(())
}

#[tokio::test]
async fn test_bad_token_is_a_response_error() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let settings = server.settings("wrong")?;

    let err = jupyter_services::kernel::restapi::list_running(&settings)
        .await
        .expect_err("forbidden");
    assert!(matches!(err, ServiceError::Response { status: 403, .. }));
    assert_eq!(err.to_string(), "Forbidden");
    Ok(())
}
