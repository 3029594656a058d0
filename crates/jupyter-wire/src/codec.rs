//! WebSocket frame codecs for kernel messages.
//!
//! Two framings are in use, chosen by the subprotocol the server accepts:
//!
//! Legacy (no subprotocol): a text frame holding the JSON message. When the
//! message carries buffers it is sent as a binary frame instead:
//!
//! ```text
//! [u32 BE: nbufs] [u32 BE offset] * nbufs [JSON message] [buffer 1] ... [buffer n-1]
//! ```
//!
//! `v1.kernel.websocket.jupyter.org`: always binary, every part addressed by a
//! little-endian u64 offset table:
//!
//! ```text
//! [u64 LE: n] [u64 LE offset] * n [channel] [header] [parent_header] [metadata] [content] [buffers...]
//! ```
//!
//! The last offset is the end of the frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::message::{KernelMessage, WireError};

/// Subprotocol name of the v1 kernel WebSocket framing.
pub const KERNEL_WEBSOCKET_PROTOCOL_V1: &str = "v1.kernel.websocket.jupyter.org";

/// Largest offset table accepted when decoding a v1 frame.
const MAX_V1_OFFSETS: u64 = 4096;

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Framing negotiated for a kernel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Legacy,
    V1,
}

impl WireProtocol {
    /// Pick the framing from the subprotocol selected by the server.
    pub fn from_subprotocol(selected: Option<&str>) -> Self {
        match selected {
            Some(KERNEL_WEBSOCKET_PROTOCOL_V1) => WireProtocol::V1,
            _ => WireProtocol::Legacy,
        }
    }
}

/// Encode a message as a single frame.
pub fn encode(msg: &KernelMessage, protocol: WireProtocol) -> Result<Frame, WireError> {
    match protocol {
        WireProtocol::Legacy => encode_legacy(msg),
        WireProtocol::V1 => encode_v1(msg).map(Frame::Binary),
    }
}

/// Decode and validate a frame into a message.
pub fn decode(frame: &Frame, protocol: WireProtocol) -> Result<KernelMessage, WireError> {
    match (frame, protocol) {
        (Frame::Text(text), _) => {
            let value: Value = serde_json::from_str(text)?;
            KernelMessage::from_value(value, Vec::new())
        }
        (Frame::Binary(data), WireProtocol::Legacy) => decode_legacy_binary(data),
        (Frame::Binary(data), WireProtocol::V1) => decode_v1(data),
    }
}

fn encode_legacy(msg: &KernelMessage) -> Result<Frame, WireError> {
    let json = serde_json::to_vec(msg)?;
    if msg.buffers.is_empty() {
        let text = String::from_utf8(json)
            .map_err(|e| WireError::MalformedFrame(format!("non-UTF-8 JSON: {}", e)))?;
        return Ok(Frame::Text(text));
    }

    let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + msg.buffers.len());
    parts.push(json.as_slice());
    parts.extend(msg.buffers.iter().map(|b| &b[..]));

    let nbufs = parts.len();
    let table_len = 4 * (nbufs + 1);
    let body_len: usize = parts.iter().map(|p| p.len()).sum();

    let mut out = BytesMut::with_capacity(table_len + body_len);
    out.put_u32(to_u32(nbufs)?);
    let mut offset = table_len;
    for part in &parts {
        out.put_u32(to_u32(offset)?);
        offset += part.len();
    }
    for part in &parts {
        out.put_slice(part);
    }
    Ok(Frame::Binary(out.freeze()))
}

fn decode_legacy_binary(data: &Bytes) -> Result<KernelMessage, WireError> {
    let nbufs = read_u32_be(data, 0)? as usize;
    if nbufs == 0 {
        return Err(malformed("binary frame without a JSON part"));
    }
    if 4 * (nbufs + 1) > data.len() {
        return Err(malformed("truncated offset table"));
    }

    let mut offsets = Vec::with_capacity(nbufs + 1);
    for i in 0..nbufs {
        offsets.push(read_u32_be(data, 4 * (i + 1))? as usize);
    }
    offsets.push(data.len());

    let parts = split_parts(data, &offsets)?;
    let value: Value = serde_json::from_slice(&parts[0])?;
    KernelMessage::from_value(value, parts[1..].to_vec())
}

fn encode_v1(msg: &KernelMessage) -> Result<Bytes, WireError> {
    let channel = msg
        .channel
        .ok_or_else(|| malformed("v1 framing requires a channel"))?;

    let header = serde_json::to_vec(&msg.header)?;
    let parent = match &msg.parent_header {
        Some(parent) => serde_json::to_vec(parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = serde_json::to_vec(&msg.metadata)?;
    let content = serde_json::to_vec(&msg.content)?;

    let mut parts: Vec<&[u8]> = vec![
        channel.as_str().as_bytes(),
        header.as_slice(),
        parent.as_slice(),
        metadata.as_slice(),
        content.as_slice(),
    ];
    parts.extend(msg.buffers.iter().map(|b| &b[..]));

    // One offset per part start plus the end of the frame.
    let offset_count = parts.len() + 1;
    let table_len = 8 * (1 + offset_count);
    let body_len: usize = parts.iter().map(|p| p.len()).sum();

    let mut out = BytesMut::with_capacity(table_len + body_len);
    out.put_u64_le(offset_count as u64);
    let mut offset = table_len;
    out.put_u64_le(offset as u64);
    for part in &parts {
        offset += part.len();
        out.put_u64_le(offset as u64);
    }
    for part in &parts {
        out.put_slice(part);
    }
    Ok(out.freeze())
}

fn decode_v1(data: &Bytes) -> Result<KernelMessage, WireError> {
    let offset_count = read_u64_le(data, 0)?;
    if !(6..=MAX_V1_OFFSETS).contains(&offset_count) {
        return Err(malformed(format!("bad v1 offset count {}", offset_count)));
    }

    let mut offsets = Vec::with_capacity(offset_count as usize);
    for i in 0..offset_count as usize {
        offsets.push(read_u64_le(data, 8 * (i + 1))? as usize);
    }
    let end = offsets.pop().unwrap_or(0);
    if end != data.len() {
        return Err(malformed("v1 end offset does not match frame length"));
    }
    offsets.push(end);

    let parts = split_parts(data, &offsets)?;
    let channel = std::str::from_utf8(&parts[0])
        .map_err(|_| malformed("channel is not UTF-8"))?
        .to_string();

    let mut msg = Map::new();
    msg.insert("channel".into(), Value::String(channel));
    msg.insert("header".into(), serde_json::from_slice(&parts[1])?);
    msg.insert("parent_header".into(), serde_json::from_slice(&parts[2])?);
    msg.insert("metadata".into(), serde_json::from_slice(&parts[3])?);
    msg.insert("content".into(), serde_json::from_slice(&parts[4])?);

    KernelMessage::from_value(Value::Object(msg), parts[5..].to_vec())
}

/// Slice `data` into the parts delimited by consecutive offsets.
fn split_parts(data: &Bytes, offsets: &[usize]) -> Result<Vec<Bytes>, WireError> {
    offsets
        .windows(2)
        .map(|w| {
            let (start, end) = (w[0], w[1]);
            if start > end || end > data.len() {
                return Err(malformed(format!(
                    "offset range {}..{} outside frame of {} bytes",
                    start,
                    end,
                    data.len()
                )));
            }
            Ok(data.slice(start..end))
        })
        .collect()
}

fn read_u32_be(data: &[u8], at: usize) -> Result<u32, WireError> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| malformed("truncated offset table"))
}

fn read_u64_le(data: &[u8], at: usize) -> Result<u64, WireError> {
    data.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| malformed("truncated offset table"))
}

fn to_u32(value: usize) -> Result<u32, WireError> {
    u32::try_from(value).map_err(|_| malformed("frame too large for legacy framing"))
}

fn malformed(reason: impl Into<String>) -> WireError {
    WireError::MalformedFrame(reason.into())
}
