//! Comms: named sub-channels multiplexed over one kernel connection.

use bytes::Bytes;
use jupyter_wire::{Channel, KernelMessage};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::connection::{KernelConnection, WeakKernelConnection};
use super::future::KernelFuture;
use crate::error::ServiceError;

/// Inbound traffic for one comm, in socket-receive order.
#[derive(Debug, Clone)]
pub enum CommEvent {
    Message(KernelMessage),
    Close(KernelMessage),
}

/// A comm the kernel opened for a registered target.
#[derive(Debug)]
pub struct IncomingComm {
    pub comm: Comm,
    /// The kernel's `comm_open`, carrying the initial `data`.
    pub open_msg: KernelMessage,
}

/// Connection-side end of a comm.
pub(crate) struct CommRoute {
    events: mpsc::UnboundedSender<CommEvent>,
}

impl CommRoute {
    pub(crate) fn deliver(&self, event: CommEvent) {
        let _ = self.events.send(event);
    }
}

/// One comm. Dropping it unregisters it from the connection without
/// notifying the kernel; call [`Comm::close`] for an orderly close.
pub struct Comm {
    comm_id: String,
    target_name: String,
    kernel: WeakKernelConnection,
    events: mpsc::UnboundedReceiver<CommEvent>,
    closed: bool,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("comm_id", &self.comm_id)
            .field("target_name", &self.target_name)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Comm {
    pub(crate) fn new(
        comm_id: &str,
        target_name: &str,
        kernel: WeakKernelConnection,
    ) -> (Self, CommRoute) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let comm = Comm {
            comm_id: comm_id.to_string(),
            target_name: target_name.to_string(),
            kernel,
            events,
            closed: false,
        };
        (comm, CommRoute { events: events_tx })
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Announce this comm to the kernel with `comm_open`.
    pub fn open(
        &self,
        data: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<KernelFuture, ServiceError> {
        let content = json!({
            "comm_id": self.comm_id,
            "target_name": self.target_name,
            "data": data,
        });
        self.send_comm("comm_open", content, metadata, buffers)
    }

    pub fn send(
        &self,
        data: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<KernelFuture, ServiceError> {
        let content = json!({"comm_id": self.comm_id, "data": data});
        self.send_comm("comm_msg", content, metadata, buffers)
    }

    /// Send `comm_close` and detach from the connection.
    pub fn close(&mut self, data: Value, metadata: Option<Value>) -> Result<KernelFuture, ServiceError> {
        let content = json!({"comm_id": self.comm_id, "data": data});
        let future = self.send_comm("comm_close", content, metadata, Vec::new())?;
        self.closed = true;
        if let Some(kernel) = self.kernel.upgrade() {
            kernel.unregister_comm(&self.comm_id);
        }
        Ok(future)
    }

    /// Next inbound event. Returns `None` once the comm is closed or the
    /// connection dropped it.
    pub async fn recv(&mut self) -> Option<CommEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(CommEvent::Close(_)) | None => self.closed = true,
            Some(CommEvent::Message(_)) => {}
        }
        event
    }

    fn send_comm(
        &self,
        msg_type: &str,
        content: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<KernelFuture, ServiceError> {
        if self.closed {
            return Err(ServiceError::InvalidState(format!(
                "comm {} is closed",
                self.comm_id
            )));
        }
        let kernel = self.kernel()?;
        let mut msg = kernel
            .new_message(Channel::Shell, msg_type, content)
            .with_buffers(buffers);
        if let Some(metadata) = metadata {
            msg = msg.with_metadata(metadata);
        }
        kernel.send_message(msg, false)
    }

    fn kernel(&self) -> Result<KernelConnection, ServiceError> {
        self.kernel
            .upgrade()
            .ok_or_else(|| ServiceError::ConnectionClosed("kernel connection was dropped".into()))
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(kernel) = self.kernel.upgrade() {
            kernel.unregister_comm(&self.comm_id);
        }
    }
}
