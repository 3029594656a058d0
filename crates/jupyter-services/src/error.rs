//! Error type shared by every layer of the client.

use jupyter_wire::WireError;
use serde_json::Value;

use crate::transport::HttpResponse;

/// Errors returned by REST calls, kernel connections and managers.
///
/// Cloneable so a single failure can be handed to several waiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// The server could not be reached at all.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a status the caller did not expect.
    #[error("{message}")]
    Response {
        status: u16,
        message: String,
        body: Option<Value>,
        traceback: Option<String>,
    },

    /// A server payload did not have the expected shape.
    #[error("Invalid server payload: {0}")]
    Validation(String),

    /// An operation was attempted on a disposed or terminated connection.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The object that owned the operation was disposed before it finished.
    #[error("Disposed")]
    Disposed,

    #[error("Kernel is dead")]
    KernelDead,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl ServiceError {
    /// Build a [`ServiceError::Response`] from an unexpected response.
    ///
    /// The message is taken from the JSON body's `message` (or `reason`)
    /// field when the server supplied one.
    pub fn from_response(response: &HttpResponse) -> Self {
        Self::from_response_with(response, None)
    }

    /// Like [`ServiceError::from_response`] but with a fixed message.
    pub fn from_response_with(response: &HttpResponse, message: Option<&str>) -> Self {
        let body: Option<Value> = serde_json::from_slice(&response.body).ok();
        let field = |key: &str| {
            body.as_ref()
                .and_then(|b| b.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let message = message
            .map(str::to_string)
            .or_else(|| field("message"))
            .or_else(|| field("reason"))
            .unwrap_or_else(|| format!("Invalid response: {}", response.status));
        let traceback = field("traceback");
        ServiceError::Response {
            status: response.status,
            message,
            body,
            traceback,
        }
    }

    /// HTTP status for response errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<WireError> for ServiceError {
    fn from(err: WireError) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<url::ParseError> for ServiceError {
    fn from(err: url::ParseError) -> Self {
        ServiceError::InvalidUrl(err.to_string())
    }
}
