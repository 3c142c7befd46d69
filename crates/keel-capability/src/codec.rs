//! Framed JSON-RPC codec.
//!
//! Every message is a header block followed by a UTF-8 JSON body:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}
//! ```
//!
//! Header lines other than `Content-Length` are ignored. Requests and
//! responses carry a numeric correlation id; messages with a `method` and no
//! `id` are notifications.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method used for tool invocations.
pub const TOOLS_CALL: &str = "tools/call";
/// Notification sent once a server is ready to accept calls.
pub const READY: &str = "ready";
/// Periodic liveness notification.
pub const HEARTBEAT: &str = "heartbeat";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Largest accepted body.
    pub max_frame_bytes: usize,
    /// Largest accepted header block, terminator included.
    pub max_header_bytes: usize,
    /// Whether the server accepts several in-flight calls on one connection.
    pub pipelining: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
            max_header_bytes: 8 * 1024,
            pipelining: true,
        }
    }
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        result: Result<Value, RpcErrorObject>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Per-connection correlation id source. Ids start at 1 and are never
/// reused for the lifetime of the connection.
#[derive(Debug)]
pub struct CorrelationIds {
    next: AtomicU64,
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Prefix `body` with its header block.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

fn encode_value(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value)
        .map(|body| encode_frame(&body))
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<Vec<u8>, ProtocolError> {
    encode_value(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    }))
}

pub fn encode_notification(method: &str, params: &Value) -> Result<Vec<u8>, ProtocolError> {
    encode_value(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    }))
}

pub fn encode_response(
    id: u64,
    result: &Result<Value, RpcErrorObject>,
) -> Result<Vec<u8>, ProtocolError> {
    let message = match result {
        Ok(value) => serde_json::json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": value}),
        Err(error) => serde_json::json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error}),
    };
    encode_value(&message)
}

/// Decode one frame body.
pub fn decode_message(body: &[u8]) -> Result<Incoming, ProtocolError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidBody {
        id: recover_id(body),
        reason: e.to_string(),
    })?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::InvalidMessage {
            id: None,
            reason: "message is not a JSON object".to_string(),
        });
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(raw.as_u64().ok_or_else(|| ProtocolError::InvalidMessage {
            id: None,
            reason: format!("correlation id must be an unsigned integer, got {raw}"),
        })?),
    };
    let invalid = |reason: &str| ProtocolError::InvalidMessage {
        id,
        reason: reason.to_string(),
    };

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return Err(invalid("method must be a string"));
        };
        let params = object.remove("params").unwrap_or(Value::Null);
        return Ok(match id {
            Some(id) => Incoming::Request { id, method, params },
            None => Incoming::Notification { method, params },
        });
    }

    let id = id.ok_or_else(|| invalid("response without an id"))?;
    match (object.remove("result"), object.remove("error")) {
        (Some(result), None) => Ok(Incoming::Response {
            id,
            result: Ok(result),
        }),
        (None, Some(error)) => {
            let error: RpcErrorObject = serde_json::from_value(error)
                .map_err(|e| invalid(&format!("malformed error object: {e}")))?;
            Ok(Incoming::Response {
                id,
                result: Err(error),
            })
        }
        (Some(_), Some(_)) => Err(invalid("response has both result and error")),
        (None, None) => Err(invalid("response has neither result nor error")),
    }
}

/// Best-effort scan for `"id": <digits>` in a body that failed to parse.
fn recover_id(body: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(body).ok()?;
    let start = text.find("\"id\"")? + 4;
    let rest = text[start..].trim_start().strip_prefix(':')?.trim_start();
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Incremental frame decoder.
///
/// Feed bytes as they arrive with [`extend`](Self::extend) and drain
/// complete bodies with [`next_frame`](Self::next_frame). A frame split
/// across any number of reads is reassembled. After a fatal error the
/// decoder must be discarded together with its stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Body bytes of an oversized frame still to be dropped.
    skip: usize,
    max_frame_bytes: usize,
    max_header_bytes: usize,
}

impl FrameDecoder {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            buf: Vec::new(),
            skip: 0,
            max_frame_bytes: config.max_frame_bytes,
            max_header_bytes: config.max_header_bytes,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.discard_skipped();
        if self.skip > 0 {
            return Ok(None);
        }

        let Some(header_len) = find(&self.buf, HEADER_TERMINATOR) else {
            if self.buf.len() > self.max_header_bytes {
                return Err(ProtocolError::HeaderTooLong {
                    max: self.max_header_bytes,
                });
            }
            return Ok(None);
        };
        let header_end = header_len + HEADER_TERMINATOR.len();
        if header_end > self.max_header_bytes {
            return Err(ProtocolError::HeaderTooLong {
                max: self.max_header_bytes,
            });
        }

        let declared = parse_content_length(&self.buf[..header_len])?;
        if declared > self.max_frame_bytes {
            self.buf.drain(..header_end);
            self.skip = declared;
            self.discard_skipped();
            return Err(ProtocolError::OversizedFrame {
                declared,
                max: self.max_frame_bytes,
            });
        }

        if self.buf.len() < header_end + declared {
            return Ok(None);
        }
        let body = self.buf[header_end..header_end + declared].to_vec();
        self.buf.drain(..header_end + declared);
        Ok(Some(body))
    }

    fn discard_skipped(&mut self) {
        if self.skip == 0 {
            return;
        }
        let n = self.skip.min(self.buf.len());
        self.buf.drain(..n);
        self.skip -= n;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &[u8]) -> Result<usize, ProtocolError> {
    let header = std::str::from_utf8(header)
        .map_err(|_| ProtocolError::MalformedHeader("header is not valid UTF-8".to_string()))?;

    let mut length = None;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::MalformedHeader(format!(
                "header line without ':': {line:?}"
            )));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                ProtocolError::MalformedHeader(format!("invalid Content-Length: {value:?}"))
            })?;
            length = Some(parsed);
        }
    }
    length.ok_or_else(|| ProtocolError::MalformedHeader("missing Content-Length".to_string()))
}

/// Build `tools/call` params.
pub fn tool_call_params(tool: &str, arguments: Value) -> Value {
    let mut params = Map::new();
    params.insert("name".to_string(), Value::String(tool.to_string()));
    params.insert("arguments".to_string(), arguments);
    Value::Object(params)
}
