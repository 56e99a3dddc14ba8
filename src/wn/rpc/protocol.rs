//! JSON-RPC 2.0 message shapes, classification, and line encoding.
//!
//! The transport is newline-delimited JSON: one value per line, and the
//! encoder never emits internal newlines (compact `serde_json` encoding
//! guarantees this).  Classification follows the JSON-RPC rules in order:
//! the value must be an object, `jsonrpc` must equal `"2.0"`, `method` must
//! be a string, and a present `id` must be a string or number.  An object
//! with `method` and a valid `id` is a request; with `method` and no `id`
//! key a notification; with `result` or `error` and no `method` a response
//! (which this core, being a server, ignores).

use serde_json::Value;

/// Parse error (malformed JSON).
pub const PARSE_ERROR: i64 = -32700;
/// The value is not a valid JSON-RPC object.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler for the requested method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parameters failed validation.
pub const INVALID_PARAMS: i64 = -32602;
/// The handler failed.
pub const INTERNAL_ERROR: i64 = -32603;

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Expects exactly one response carrying the same id.
    Request {
        /// String or number, echoed back verbatim.
        id: Value,
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// Fire-and-forget; gets no response.
    Notification {
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// A response shape.  This core is a server, not a client, so responses
    /// are classified and then dropped.
    Response,
}

/// A decode failure, carrying the JSON-RPC error to send back.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// Decode one line into a classified message.
pub fn decode(line: &str) -> Result<Incoming, DecodeError> {
    let value: Value = serde_json::from_str(line).map_err(|_| DecodeError {
        code: PARSE_ERROR,
        message: "Parse error".to_string(),
    })?;
    classify(value)
}

/// Classify an already-parsed JSON value.
pub fn classify(value: Value) -> Result<Incoming, DecodeError> {
    let invalid = |message: &str| DecodeError {
        code: INVALID_REQUEST,
        message: message.to_string(),
    };

    let Value::Object(map) = value else {
        return Err(invalid("Invalid Request: not an object"));
    };

    if map.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Err(invalid("Invalid Request: jsonrpc must be \"2.0\""));
    }

    match map.get("method") {
        Some(method) => {
            let Some(method) = method.as_str() else {
                return Err(invalid("Invalid Request: method must be a string"));
            };
            let params = map.get("params").cloned();
            match map.get("id") {
                None => Ok(Incoming::Notification {
                    method: method.to_string(),
                    params,
                }),
                Some(id) if id.is_string() || id.is_number() => Ok(Incoming::Request {
                    id: id.clone(),
                    method: method.to_string(),
                    params,
                }),
                Some(_) => Err(invalid("Invalid Request: id must be a string or number")),
            }
        }
        None => {
            if map.contains_key("result") || map.contains_key("error") {
                Ok(Incoming::Response)
            } else {
                Err(invalid("Invalid Request: missing method"))
            }
        }
    }
}

/// Encode a success response as one line (no trailing newline).
pub fn success_line(id: &Value, result: Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
    .to_string()
}

/// Encode an error response as one line.  `id` is `null` when the failing
/// input had no usable id.
pub fn error_line(id: &Value, code: i64, message: &str, data: Option<Value>) -> String {
    let mut error = serde_json::json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
    .to_string()
}

/// Encode a server-initiated notification as one line.
pub fn notification_line(method: &str, params: Option<Value>) -> String {
    match params {
        Some(params) => serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
        .to_string(),
        None => serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        })
        .to_string(),
    }
}
