//! Line codec for newline-delimited JSON-RPC frames.
//!
//! Child-process servers intermix free-text logging with protocol frames on
//! the same stream, so decoding is deliberately tolerant: a line that is not
//! valid JSON, or valid JSON without a `jsonrpc` field, is classified as
//! [`Decoded::NotProtocol`] and forwarded to the host as diagnostic output.
//! Only a line that *claims* to be JSON-RPC but is structurally broken
//! produces a [`McpError::Protocol`].

use serde::Serialize;
use serde_json::Value;

use crate::error::McpError;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// A decoded protocol frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Outcome of decoding one line.
#[derive(Debug)]
pub enum Decoded {
    /// The line was a protocol frame.
    Frame(Frame),
    /// The line is server log output, not a protocol message.
    NotProtocol,
}

/// Serialize a message to its single-line wire form (no trailing newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String, McpError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one line from a transport stream.
///
/// Returns `Ok(Decoded::NotProtocol)` for anything that does not look like
/// JSON-RPC at all, and `Err(McpError::Protocol)` for a frame that claims
/// `jsonrpc` membership but violates the message shape.
pub fn decode_line(line: &str) -> Result<Decoded, McpError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Decoded::NotProtocol);
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Ok(Decoded::NotProtocol),
    };

    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Ok(Decoded::NotProtocol),
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some("2.0") => {}
        Some(version) => {
            return Err(McpError::Protocol(format!(
                "unsupported jsonrpc version \"{}\"",
                version
            )));
        }
        None => return Ok(Decoded::NotProtocol),
    }

    if obj.contains_key("method") {
        if obj.contains_key("id") {
            let request: JsonRpcRequest = serde_json::from_value(value)
                .map_err(|e| McpError::Protocol(format!("malformed request frame: {}", e)))?;
            Ok(Decoded::Frame(Frame::Request(request)))
        } else {
            let notification: JsonRpcNotification = serde_json::from_value(value)
                .map_err(|e| McpError::Protocol(format!("malformed notification frame: {}", e)))?;
            Ok(Decoded::Frame(Frame::Notification(notification)))
        }
    } else if obj.contains_key("id") {
        if !obj.contains_key("result") && !obj.contains_key("error") {
            return Err(McpError::Protocol(
                "response frame has neither result nor error".to_string(),
            ));
        }
        let response: JsonRpcResponse = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("malformed response frame: {}", e)))?;
        Ok(Decoded::Frame(Frame::Response(response)))
    } else {
        Err(McpError::Protocol(
            "frame has neither method nor id".to_string(),
        ))
    }
}
