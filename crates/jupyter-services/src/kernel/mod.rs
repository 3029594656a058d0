//! Kernels: REST client, live connections, reply futures, comms and the
//! polling manager.

mod comm;
mod connection;
mod future;
mod manager;
pub mod restapi;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use comm::{Comm, CommEvent, IncomingComm};
pub use connection::{
    ExecuteOptions, KernelConnection, KernelConnectionOptions, ReconnectPolicy,
};
pub use future::KernelFuture;
pub use manager::KernelManager;

/// A kernel process on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
}

/// Options for starting a kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KernelOptions {
    /// Kernelspec name; the server's default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

impl KernelOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            env: None,
        }
    }
}

/// Execution status of a kernel as reported on iopub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Terminating,
    Restarting,
    AutoRestarting,
    Dead,
}

impl KernelStatus {
    /// Map an iopub `execution_state` onto a status.
    ///
    /// A kernel announcing `restarting` was restarted by the server, not by
    /// this client, hence `AutoRestarting`.
    pub fn from_execution_state(state: &str) -> Option<Self> {
        match state {
            "starting" => Some(KernelStatus::Starting),
            "idle" => Some(KernelStatus::Idle),
            "busy" => Some(KernelStatus::Busy),
            "terminating" => Some(KernelStatus::Terminating),
            "restarting" => Some(KernelStatus::AutoRestarting),
            "dead" => Some(KernelStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Terminating => write!(f, "terminating"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::AutoRestarting => write!(f, "autorestarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// State of the WebSocket under a kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}
