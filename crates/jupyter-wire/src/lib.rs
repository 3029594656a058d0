//! Jupyter kernel messages as they travel over a kernel WebSocket.
//!
//! This crate has no I/O. It provides:
//!
//! - [`KernelMessage`], the message shape exchanged with a kernel (header,
//!   parent header, metadata, raw JSON content, binary buffers, channel)
//! - Shape validation for inbound JSON before it is trusted
//! - Frame codecs for the legacy JSON/binary framing and the
//!   `v1.kernel.websocket.jupyter.org` subprotocol

mod codec;
mod message;
mod validate;

pub use codec::{decode, encode, Frame, WireProtocol, KERNEL_WEBSOCKET_PROTOCOL_V1};
pub use message::{Channel, KernelMessage, WireError, PROTOCOL_VERSION};
pub use validate::validate_message;

pub use jupyter_protocol::Header;
