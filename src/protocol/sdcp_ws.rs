//! WebSocket-SDCP dialect (newer resin and FDM machines).
//!
//! One full-duplex JSON stream. Every frame carries its own `Topic` field;
//! there is no transport-level routing. Request ids are 16-hex strings on the
//! wire and map to the canonical `u64` id.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use super::{CommandEnvelope, InboundMessage, ResponseEnvelope};
use crate::error::{ElegooError, Result};
use crate::transport::WireFrame;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format the canonical request id the way this dialect writes it.
pub fn wire_request_id(request_id: u64) -> String {
    format!("{request_id:016x}")
}

/// Parse a wire request id back into the canonical form.
pub fn parse_request_id(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw, 16).ok()
}

pub fn encode_command(mainboard_id: &str, env: &CommandEnvelope) -> WireFrame {
    let payload = json!({
        "Id": mainboard_id,
        "Data": {
            "Cmd": env.method,
            "Data": env.params,
            "RequestID": wire_request_id(env.request_id),
            "MainboardID": mainboard_id,
            "TimeStamp": epoch_secs(),
            "From": 0,
        },
        "Topic": format!("sdcp/request/{mainboard_id}"),
    });
    WireFrame {
        topic: None,
        payload: payload.to_string(),
    }
}

/// Classify a frame by the `Topic` field embedded in its payload.
pub fn decode_frame(payload: &str) -> Result<InboundMessage> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ElegooError::ProtocolError(format!("bad sdcp frame: {e}")))?;
    decode_value(value)
}

pub(super) fn decode_value(value: Value) -> Result<InboundMessage> {
    let topic_kind = value
        .get("Topic")
        .and_then(Value::as_str)
        .and_then(|t| t.split('/').nth(1))
        .map(str::to_string);

    match topic_kind.as_deref() {
        Some("response") => {
            let data = value
                .get("Data")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            decode_response(&data, value.clone())
        }
        Some("status") => Ok(decode_status(&value)),
        Some("attributes") => Ok(InboundMessage::Attributes(value)),
        Some("notice") | Some("error") => Ok(InboundMessage::Notice(value)),
        Some("request") => {
            // Echo of someone else's request (seen through the proxy tap).
            Ok(InboundMessage::Unknown {
                method: value
                    .pointer("/Data/Cmd")
                    .and_then(Value::as_u64)
                    .map(|m| m as u32),
                raw: value,
            })
        }
        _ => {
            // Some firmware omits Topic on status pushes.
            if value.get("Status").is_some() {
                return Ok(decode_status(&value));
            }
            Ok(InboundMessage::Unknown {
                method: None,
                raw: value,
            })
        }
    }
}

fn decode_response(data: &Map<String, Value>, raw: Value) -> Result<InboundMessage> {
    let request_id = data
        .get("RequestID")
        .and_then(Value::as_str)
        .and_then(parse_request_id);
    let method = data.get("Cmd").and_then(Value::as_u64).map(|m| m as u32);
    match (request_id, method) {
        (Some(request_id), Some(method)) => {
            let result = data.get("Data").cloned().unwrap_or(Value::Null);
            let error_code = result.get("Ack").and_then(Value::as_i64).unwrap_or(0);
            Ok(InboundMessage::Response(ResponseEnvelope {
                request_id,
                method,
                error_code,
                result,
            }))
        }
        _ => Ok(InboundMessage::Unknown { method, raw }),
    }
}

fn decode_status(value: &Value) -> InboundMessage {
    // This dialect pushes full trees; the timestamp doubles as update id.
    let update_id = value
        .get("TimeStamp")
        .or_else(|| value.pointer("/Status/TimeStamp"))
        .and_then(Value::as_u64)
        .unwrap_or_else(epoch_secs);
    InboundMessage::Status {
        update_id,
        full: true,
        tree: value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::legacy_methods;

    #[test]
    fn request_id_round_trips() {
        let wire = wire_request_id(1001);
        assert_eq!(wire.len(), 16);
        assert_eq!(parse_request_id(&wire), Some(1001));
    }

    #[test]
    fn encode_shapes_the_envelope() {
        let env = CommandEnvelope {
            request_id: 5,
            method: legacy_methods::GET_STATUS,
            params: json!({}),
        };
        let frame = encode_command("ABC123", &env);
        let value: Value = serde_json::from_str(&frame.payload).unwrap();
        assert_eq!(value["Id"], "ABC123");
        assert_eq!(value["Data"]["Cmd"], 0);
        assert_eq!(value["Data"]["MainboardID"], "ABC123");
        assert_eq!(value["Topic"], "sdcp/request/ABC123");
        assert_eq!(
            value["Data"]["RequestID"].as_str().unwrap(),
            wire_request_id(5)
        );
    }

    #[test]
    fn decode_response_with_ack() {
        let payload = json!({
            "Id": "ABC123",
            "Data": {
                "Cmd": 386,
                "RequestID": wire_request_id(9),
                "Data": { "Ack": 1, "VideoUrl": "" },
            },
            "Topic": "sdcp/response/ABC123",
        })
        .to_string();
        match decode_frame(&payload).unwrap() {
            InboundMessage::Response(resp) => {
                assert_eq!(resp.request_id, 9);
                assert_eq!(resp.method, 386);
                assert_eq!(resp.error_code, 1);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn decode_status_push() {
        let payload = json!({
            "Status": { "CurrentStatus": [1] },
            "MainboardID": "ABC123",
            "TimeStamp": 1234,
            "Topic": "sdcp/status/ABC123",
        })
        .to_string();
        match decode_frame(&payload).unwrap() {
            InboundMessage::Status {
                update_id, full, ..
            } => {
                assert_eq!(update_id, 1234);
                assert!(full);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frames_keep_their_payload() {
        let payload = json!({ "Weird": true }).to_string();
        match decode_frame(&payload).unwrap() {
            InboundMessage::Unknown { raw, .. } => assert_eq!(raw["Weird"], true),
            other => panic!("expected unknown, got {other:?}"),
        }
    }
}
