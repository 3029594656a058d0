//! Client for a Jupyter server's kernel and session services.
//!
//! Layers, bottom up:
//!
//! - [`transport`]: one HTTP request with auth headers injected, behind the
//!   [`Fetch`] trait so tests and hosts can swap the HTTP stack
//! - REST clients per resource: [`kernel::restapi`], [`session::restapi`],
//!   [`kernelspec`], [`terminal`], each validating the server's JSON
//! - [`KernelConnection`]: the channels WebSocket with reconnect, reply
//!   futures and [`Comm`]s
//! - [`KernelManager`] and [`SessionManager`]: polled caches that emit only
//!   when the server's view actually changes
//!
//! Everything async runs on tokio; change notifications are
//! [`tokio::sync::broadcast`] receivers.

pub mod error;
pub mod kernel;
pub mod kernelspec;
pub mod manager;
pub mod session;
pub mod settings;
pub mod signal;
pub mod socket;
pub mod terminal;
pub mod transport;
pub mod validate;

#[cfg(test)]
mod test_support;

pub use error::ServiceError;
pub use kernel::{
    Comm, CommEvent, ConnectionStatus, ExecuteOptions, IncomingComm, KernelConnection,
    KernelConnectionOptions, KernelFuture, KernelManager, KernelModel, KernelOptions,
    KernelStatus, ReconnectPolicy,
};
pub use kernelspec::{KernelSpecModel, KernelSpecs};
pub use manager::{AlwaysVisible, ManagerOptions, PollOptions, Visibility};
pub use session::{
    KernelRequest, SessionConnection, SessionManager, SessionModel, SessionProperty,
    SessionRequest,
};
pub use settings::ServerSettings;
pub use socket::{SocketChannel, SocketFactory, TungsteniteSocketFactory};
pub use terminal::TerminalModel;
pub use transport::{Fetch, HttpRequest, HttpResponse, ReqwestFetch};

pub use jupyter_wire::{Channel, KernelMessage};
