//! CC2 (Centauri Carbon 2) MQTT dialect.
//!
//! The printer hosts the broker. Commands are `{id, method, params}` objects
//! published on per-client topics; responses mirror them as
//! `{id, method, result}`. Status deltas arrive on the shared
//! `elegoo/<sn>/api_status` topic with method 6000.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde_json::{json, Value};

use super::{cc2_methods, CommandEnvelope, InboundMessage, ResponseEnvelope};
use crate::error::{ElegooError, Result};
use crate::transport::WireFrame;

/// Topic the registration payload is published to.
pub fn register_topic(serial: &str) -> String {
    format!("elegoo/{serial}/api_register")
}

/// Topic the registration reply arrives on.
pub fn register_response_topic(serial: &str, request_id: &str) -> String {
    format!("elegoo/{serial}/{request_id}/register_response")
}

/// Per-client command/heartbeat topic.
pub fn request_topic(serial: &str, client_id: &str) -> String {
    format!("elegoo/{serial}/{client_id}/api_request")
}

/// Per-client response topic.
pub fn response_topic(serial: &str, client_id: &str) -> String {
    format!("elegoo/{serial}/{client_id}/api_response")
}

/// Shared status-event topic.
pub fn status_topic(serial: &str) -> String {
    format!("elegoo/{serial}/api_status")
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Generate a CC2 client id.
///
/// The broker only admits ids of exactly 10 characters shaped
/// `"0cli" + last 5 hex digits of epoch millis + random hex`; the older
/// `1_PC_<n>` form is rejected outright.
pub fn generate_client_id() -> String {
    let millis = format!("{:x}", epoch_millis());
    let tail: String = millis
        .chars()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let mut rng = rand::thread_rng();
    let mut id = format!("0cli{tail}");
    while id.len() < 10 {
        id.push(char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'));
    }
    id.truncate(10);
    id
}

/// Generate a registration request id: 16 random hex chars plus the hex of
/// the current epoch millis.
pub fn generate_register_request_id() -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..16)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("{random}{:x}", epoch_millis())
}

/// Registration payload published to [`register_topic`].
pub fn register_payload(client_id: &str, request_id: &str) -> String {
    json!({ "client_id": client_id, "request_id": request_id }).to_string()
}

/// Heartbeat PING payload.
pub fn ping_payload() -> String {
    json!({ "type": "PING" }).to_string()
}

pub fn encode_command(serial: &str, client_id: &str, env: &CommandEnvelope) -> WireFrame {
    let payload = json!({
        "id": env.request_id,
        "method": env.method,
        "params": env.params,
    });
    WireFrame {
        topic: Some(request_topic(serial, client_id)),
        payload: payload.to_string(),
    }
}

pub fn decode_frame(frame: &WireFrame) -> Result<InboundMessage> {
    let topic = frame.topic.as_deref().unwrap_or("");
    let value: Value = serde_json::from_str(&frame.payload)
        .map_err(|e| ElegooError::ProtocolError(format!("bad cc2 frame: {e}")))?;

    // PONGs come back on the response topic without an id.
    if value.get("type").and_then(Value::as_str) == Some("PONG") {
        return Ok(InboundMessage::Pong);
    }

    if topic.ends_with("/register_response") {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("missing error field")
            .to_string();
        return Ok(InboundMessage::RegisterReply { error });
    }

    let method = value.get("method").and_then(Value::as_u64).map(|m| m as u32);
    let result = value.get("result").cloned().unwrap_or(Value::Null);

    if topic.ends_with("/api_status") {
        return Ok(match method {
            Some(cc2_methods::EVENT_STATUS) => {
                let update_id = result
                    .get("sequence")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                InboundMessage::Status {
                    update_id,
                    full: false,
                    tree: result,
                }
            }
            Some(cc2_methods::EVENT_ATTRIBUTES) => InboundMessage::Attributes(result),
            other => InboundMessage::Unknown {
                method: other,
                raw: value,
            },
        });
    }

    if topic.ends_with("/api_response") {
        let request_id = value.get("id").and_then(Value::as_u64);
        return match (request_id, method) {
            (Some(request_id), Some(method)) => {
                let error_code = result
                    .get("error_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                Ok(InboundMessage::Response(ResponseEnvelope {
                    request_id,
                    method,
                    error_code,
                    result,
                }))
            }
            _ => Ok(InboundMessage::Unknown {
                method,
                raw: value,
            }),
        };
    }

    Ok(InboundMessage::Unknown { method, raw: value })
}
