//! Shape checks for inbound kernel messages.
//!
//! Decoding with serde alone would accept messages that later confuse the
//! dispatcher (a status without `execution_state`, a comm message without
//! `comm_id`). These checks run before a message is handed to anyone.

use serde_json::{Map, Value};

use crate::message::{Channel, WireError};

const HEADER_FIELDS: [&str; 6] = ["msg_id", "msg_type", "session", "username", "version", "date"];

/// Validate the JSON shape of a kernel message.
pub fn validate_message(value: &Value) -> Result<(), WireError> {
    let msg = value
        .as_object()
        .ok_or_else(|| invalid("message is not an object"))?;

    let header = require_object(msg, "header")?;
    validate_header(header, "header")?;

    match msg.get("parent_header") {
        None | Some(Value::Null) => {}
        Some(Value::Object(parent)) if parent.is_empty() => {}
        Some(Value::Object(parent)) => validate_header(parent, "parent_header")?,
        Some(_) => return Err(invalid("parent_header is not an object")),
    }

    for key in ["metadata", "content"] {
        match msg.get(key) {
            None | Some(Value::Object(_)) => {}
            Some(_) => return Err(invalid(format!("{} is not an object", key))),
        }
    }

    let channel = match msg.get("channel") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(
            Channel::parse(name).ok_or_else(|| invalid(format!("unknown channel {:?}", name)))?,
        ),
        Some(_) => return Err(invalid("channel is not a string")),
    };

    let msg_type = header
        .get("msg_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let content = msg.get("content").and_then(Value::as_object);

    if msg_type == "status" && matches!(channel, None | Some(Channel::Iopub)) {
        require_content_string(content, "execution_state", msg_type)?;
    }
    if matches!(msg_type, "comm_open" | "comm_msg" | "comm_close") {
        require_content_string(content, "comm_id", msg_type)?;
    }
    if msg_type == "comm_open" {
        require_content_string(content, "target_name", msg_type)?;
    }

    Ok(())
}

fn validate_header(header: &Map<String, Value>, name: &str) -> Result<(), WireError> {
    for field in HEADER_FIELDS {
        match header.get(field) {
            Some(Value::String(_)) => {}
            Some(_) => return Err(invalid(format!("{}.{} is not a string", name, field))),
            None => return Err(invalid(format!("{} is missing {}", name, field))),
        }
    }
    Ok(())
}

fn require_object<'a>(
    msg: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a Map<String, Value>, WireError> {
    match msg.get(key) {
        Some(Value::Object(obj)) => Ok(obj),
        Some(_) => Err(invalid(format!("{} is not an object", key))),
        None => Err(invalid(format!("missing {}", key))),
    }
}

fn require_content_string(
    content: Option<&Map<String, Value>>,
    field: &str,
    msg_type: &str,
) -> Result<(), WireError> {
    match content.and_then(|c| c.get(field)) {
        Some(Value::String(_)) => Ok(()),
        _ => Err(invalid(format!(
            "{} content requires a string {}",
            msg_type, field
        ))),
    }
}

fn invalid(reason: impl Into<String>) -> WireError {
    WireError::InvalidMessage(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(msg_type: &str) -> Value {
        json!({
            "msg_id": "id-1",
            "msg_type": msg_type,
            "session": "s",
            "username": "u",
            "version": "5.3",
            "date": "2025-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_valid_stream_message() {
        let msg = json!({
            "header": header("stream"),
            "parent_header": {},
            "metadata": {},
            "content": {"name": "stdout", "text": "hi"},
            "channel": "iopub"
        });
        assert!(validate_message(&msg).is_ok());
    }

    #[test]
    fn test_header_field_must_be_string() {
        let mut h = header("stream");
        h["msg_id"] = json!(42);
        let msg = json!({"header": h, "content": {}});
        let err = validate_message(&msg).unwrap_err();
        assert!(err.to_string().contains("header.msg_id"));
    }

    #[test]
    fn test_missing_header() {
        let msg = json!({"content": {}});
        assert!(validate_message(&msg).is_err());
    }

    #[test]
    fn test_non_empty_parent_is_checked() {
        let msg = json!({
            "header": header("stream"),
            "parent_header": {"msg_id": "p"},
            "content": {}
        });
        let err = validate_message(&msg).unwrap_err();
        assert!(err.to_string().contains("parent_header"));
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let msg = json!({"header": header("stream"), "content": {}, "channel": "hb"});
        assert!(validate_message(&msg).is_err());
    }

    #[test]
    fn test_status_requires_execution_state() {
        let msg = json!({"header": header("status"), "content": {}, "channel": "iopub"});
        assert!(validate_message(&msg).is_err());

        let ok = json!({
            "header": header("status"),
            "content": {"execution_state": "busy"},
            "channel": "iopub"
        });
        assert!(validate_message(&ok).is_ok());
    }

    #[test]
    fn test_comm_messages_require_comm_id() {
        let msg = json!({"header": header("comm_msg"), "content": {"data": {}}});
        assert!(validate_message(&msg).is_err());

        let open = json!({"header": header("comm_open"), "content": {"comm_id": "c"}});
        assert!(validate_message(&open).is_err(), "comm_open needs target_name");
    }

    #[test]
    fn test_validation_is_idempotent() {
        let msg = json!({
            "header": header("execute_reply"),
            "parent_header": header("execute_request"),
            "content": {"status": "ok"},
            "channel": "shell"
        });
        assert!(validate_message(&msg).is_ok());
        assert!(validate_message(&msg).is_ok());
    }
}
