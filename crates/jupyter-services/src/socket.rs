//! Pluggable WebSocket construction.
//!
//! A kernel connection never touches a WebSocket type directly. It asks the
//! settings' [`SocketFactory`] for a [`SocketChannel`], a pair of frame
//! channels. The incoming side ending (`recv()` returning `None`) means the
//! socket closed; dropping the outgoing sender closes it from our side.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use jupyter_wire::Frame;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::ServiceError;

const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// An open socket, as seen by a kernel connection.
pub struct SocketChannel {
    /// Subprotocol the server selected, if any.
    pub protocol: Option<String>,
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Open a socket to `url`, offering `protocols` as subprotocols.
    async fn connect(
        &self,
        url: &Url,
        protocols: &[&str],
        headers: &[(String, String)],
    ) -> Result<SocketChannel, ServiceError>;
}

/// Default [`SocketFactory`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteSocketFactory;

#[async_trait]
impl SocketFactory for TungsteniteSocketFactory {
    async fn connect(
        &self,
        url: &Url,
        protocols: &[&str],
        headers: &[(String, String)],
    ) -> Result<SocketChannel, ServiceError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ServiceError::InvalidUrl(e.to_string()))?;

        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
            request.headers_mut().insert(SUBPROTOCOL_HEADER, value);
        }
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ServiceError::InvalidState(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        let protocol = response
            .headers()
            .get(SUBPROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(data) => Message::Binary(data.to_vec()),
                };
                if let Err(e) = sink.send(message).await {
                    warn!("[socket] Write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(data)) => Frame::Binary(Bytes::from(data)),
                    Ok(Message::Close(reason)) => {
                        debug!("[socket] Closed by server: {:?}", reason);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("[socket] Read failed: {}", e);
                        break;
                    }
                };
                if incoming_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(SocketChannel {
            protocol,
            outgoing,
            incoming,
        })
    }
}
