//! Minimal SignalR JSON hub protocol framing.
//!
//! Only the subset a receiving client needs: the handshake, invocation
//! messages, pings and close. Every record on the wire is a JSON object
//! terminated by the 0x1E record separator; one WebSocket text frame may
//! carry several records.

use serde::Deserialize;
use serde_json::Value;

use crate::ApiError;

/// Record separator terminating every hub message.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Server invoked a client method.
    Invocation { target: String, arguments: Vec<Value> },
    /// Keep-alive.
    Ping,
    /// Server is closing the connection.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Any other message type (stream items, completions, acks).
    Other(u64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<u64>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// The handshake record selecting the JSON protocol.
pub fn handshake_request() -> String {
    let mut frame = serde_json::json!({ "protocol": "json", "version": 1 }).to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// A ping record, sent by the client to keep the connection alive.
pub fn ping_record() -> String {
    let mut frame = serde_json::json!({ "type": PING }).to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Split one text frame into its records.
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

/// Check the server's handshake response record.
pub fn check_handshake(record: &str) -> Result<(), ApiError> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| ApiError::Protocol(format!("bad handshake response: {}", e)))?;
    match response.error {
        Some(error) => Err(ApiError::Protocol(format!("handshake rejected: {}", error))),
        None => Ok(()),
    }
}

/// Decode one record.
pub fn parse_message(record: &str) -> Result<HubMessage, ApiError> {
    let raw: RawMessage = serde_json::from_str(record)?;
    match raw.kind {
        Some(INVOCATION) => {
            let target = raw
                .target
                .ok_or_else(|| ApiError::Protocol("invocation without target".to_string()))?;
            Ok(HubMessage::Invocation {
                target,
                arguments: raw.arguments,
            })
        }
        Some(PING) => Ok(HubMessage::Ping),
        Some(CLOSE) => Ok(HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        }),
        Some(other) => Ok(HubMessage::Other(other)),
        None => Err(ApiError::Protocol("message without type".to_string())),
    }
}
