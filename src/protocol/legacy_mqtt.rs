//! Legacy MQTT dialect (CC1 and older firmware).
//!
//! The frame body is the WebSocket-SDCP shape, re-wrapped in MQTT topics of
//! the form `sdcp/<kind>/<mainboardId>` on the host-side embedded broker. The
//! printer is steered to that broker by the discovery-phase `M66666`
//! directive, not by anything at this layer.

use super::{sdcp_ws, CommandEnvelope, InboundMessage};
use crate::error::Result;
use crate::transport::WireFrame;

pub fn request_topic(mainboard_id: &str) -> String {
    format!("sdcp/request/{mainboard_id}")
}

/// Topics a session must subscribe to for one printer.
pub fn subscription_topics(mainboard_id: &str) -> Vec<String> {
    ["response", "status", "attributes", "notice", "error"]
        .iter()
        .map(|kind| format!("sdcp/{kind}/{mainboard_id}"))
        .collect()
}

pub fn encode_command(mainboard_id: &str, env: &CommandEnvelope) -> WireFrame {
    let inner = sdcp_ws::encode_command(mainboard_id, env);
    WireFrame {
        topic: Some(request_topic(mainboard_id)),
        payload: inner.payload,
    }
}

/// Decode an inbound frame. The payload's embedded `Topic` field is
/// authoritative; the MQTT topic is only a routing duplicate.
pub fn decode_frame(frame: &WireFrame) -> Result<InboundMessage> {
    sdcp_ws::decode_frame(&frame.payload)
}
