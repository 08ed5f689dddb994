//! Wire codecs for the three SDCP dialects.
//!
//! All dialects share the canonical [`CommandEnvelope`]/[`ResponseEnvelope`]
//! pair; the submodules translate to and from the per-dialect JSON shapes.
//! Unknown fields ride along as raw [`serde_json::Value`]s so frames from
//! newer firmware still round-trip.

pub mod cc2;
pub mod legacy_mqtt;
pub mod sdcp_ws;

use serde_json::{json, Value};

use crate::error::{ElegooError, Result};
use crate::model::{FanId, ProtocolKind, SpeedMode, StorageMedium};
use crate::transport::WireFrame;

/// Method codes for the legacy WebSocket/MQTT dialect.
pub mod legacy_methods {
    pub const GET_STATUS: u32 = 0;
    pub const GET_ATTRIBUTES: u32 = 1;
    pub const START_PRINT: u32 = 128;
    pub const PAUSE_PRINT: u32 = 129;
    pub const STOP_PRINT: u32 = 130;
    pub const RESUME_PRINT: u32 = 131;
    pub const STOP_FEEDING: u32 = 132;
    pub const SKIP_PREHEAT: u32 = 133;
    pub const RENAME_PRINTER: u32 = 192;
    pub const TERMINATE_TRANSFER: u32 = 255;
    pub const LIST_FILES: u32 = 258;
    pub const BATCH_DELETE_FILES: u32 = 259;
    pub const HISTORY_TASKS: u32 = 320;
    pub const TASK_DETAILS: u32 = 321;
    pub const SET_VIDEO_STREAM: u32 = 386;
    pub const SET_TIMELAPSE: u32 = 387;
    pub const CONTROL_DEVICE: u32 = 403;
}

/// Method codes for the CC2 dialect.
pub mod cc2_methods {
    pub const GET_ATTRIBUTES: u32 = 1001;
    pub const GET_STATUS: u32 = 1002;
    pub const START_PRINT: u32 = 1020;
    pub const PAUSE_PRINT: u32 = 1021;
    pub const STOP_PRINT: u32 = 1022;
    pub const RESUME_PRINT: u32 = 1023;
    pub const SET_TEMPERATURE: u32 = 1028;
    pub const SET_LIGHT: u32 = 1029;
    pub const SET_FAN_SPEED: u32 = 1030;
    pub const SET_PRINT_SPEED: u32 = 1033;
    pub const GET_DISK_INFO: u32 = 1045;
    pub const GET_FILE_DETAIL: u32 = 1046;
    pub const LIST_FILES: u32 = 1047;
    pub const GET_CANVAS_STATUS: u32 = 1048;
    pub const SET_VIDEO_STREAM: u32 = 1050;
    pub const EVENT_STATUS: u32 = 6000;
    pub const EVENT_ATTRIBUTES: u32 = 6001;
    pub const DISCOVER: u32 = 7000;
}

/// A command on its way to the printer, dialect-independent.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    /// Monotonically increasing per session; the response-matching key.
    pub request_id: u64,
    pub method: u32,
    pub params: Value,
}

/// A response from the printer, dialect-independent.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub method: u32,
    /// 0 means success.
    pub error_code: i64,
    pub result: Value,
}

/// Anything that can arrive from the printer.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(ResponseEnvelope),
    /// A status tree; `full` distinguishes authoritative replacements from
    /// deltas that must be merged.
    Status {
        update_id: u64,
        full: bool,
        tree: Value,
    },
    Attributes(Value),
    /// CC2 registration reply; `error` is `"ok"` on success.
    RegisterReply {
        error: String,
    },
    Pong,
    Notice(Value),
    Unknown {
        method: Option<u32>,
        raw: Value,
    },
}

/// Per-session routing context for a dialect.
#[derive(Debug, Clone)]
pub enum Dialect {
    SdcpWs { mainboard_id: String },
    Cc2 { serial: String, client_id: String },
    LegacyMqtt { mainboard_id: String },
}

impl Dialect {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            Dialect::SdcpWs { .. } => ProtocolKind::WebsocketSdcp,
            Dialect::Cc2 { .. } => ProtocolKind::MqttCc2,
            Dialect::LegacyMqtt { .. } => ProtocolKind::MqttLegacy,
        }
    }

    /// Encode a canonical command into a wire frame for this dialect.
    pub fn encode_command(&self, env: &CommandEnvelope) -> WireFrame {
        match self {
            Dialect::SdcpWs { mainboard_id } => sdcp_ws::encode_command(mainboard_id, env),
            Dialect::Cc2 { serial, client_id } => cc2::encode_command(serial, client_id, env),
            Dialect::LegacyMqtt { mainboard_id } => legacy_mqtt::encode_command(mainboard_id, env),
        }
    }

    /// Decode an inbound wire frame.
    pub fn decode_frame(&self, frame: &WireFrame) -> Result<InboundMessage> {
        match self {
            Dialect::SdcpWs { .. } => sdcp_ws::decode_frame(&frame.payload),
            Dialect::Cc2 { .. } => cc2::decode_frame(frame),
            Dialect::LegacyMqtt { .. } => legacy_mqtt::decode_frame(frame),
        }
    }

    /// The wire method that requests a full status refresh.
    pub fn status_method(&self) -> u32 {
        match self {
            Dialect::Cc2 { .. } => cc2_methods::GET_STATUS,
            _ => legacy_methods::GET_STATUS,
        }
    }

    /// The wire method that requests the attributes tree.
    pub fn attributes_method(&self) -> u32 {
        match self {
            Dialect::Cc2 { .. } => cc2_methods::GET_ATTRIBUTES,
            _ => legacy_methods::GET_ATTRIBUTES,
        }
    }
}

/// The typed commands the client façade exposes.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    GetAttributes,
    GetStatus,
    StartPrint {
        filename: String,
        storage: StorageMedium,
    },
    PausePrint,
    ResumePrint,
    StopPrint,
    SetNozzleTemp(u32),
    SetBedTemp(u32),
    SetFanSpeed {
        fan: FanId,
        duty: u8,
    },
    SetLight {
        on: bool,
        rgb: Option<[u8; 3]>,
    },
    SetPrintSpeedMode(SpeedMode),
    EnableVideoStream {
        enable: bool,
    },
    ListFiles {
        path: String,
    },
    GetFileDetail {
        filename: String,
        storage: StorageMedium,
    },
    GetDiskInfo,
    GetCanvasStatus,
}

impl CommandKind {
    /// Translate to `(method, params)` for a dialect.
    ///
    /// CC2 takes duty values and mode indices; the legacy dialect takes
    /// percentages and full parameter trees under command 403. Kinds the
    /// dialect cannot express return a protocol error instead of guessing.
    pub fn encode(&self, protocol: ProtocolKind) -> Result<(u32, Value)> {
        let cc2 = protocol == ProtocolKind::MqttCc2;
        let unsupported = |what: &str| {
            Err(ElegooError::ProtocolError(format!(
                "{what} is not available on {protocol:?}"
            )))
        };
        let encoded = match self {
            CommandKind::GetAttributes => {
                if cc2 {
                    (cc2_methods::GET_ATTRIBUTES, json!({}))
                } else {
                    (legacy_methods::GET_ATTRIBUTES, json!({}))
                }
            }
            CommandKind::GetStatus => {
                if cc2 {
                    (cc2_methods::GET_STATUS, json!({}))
                } else {
                    (legacy_methods::GET_STATUS, json!({}))
                }
            }
            CommandKind::StartPrint { filename, storage } => {
                if cc2 {
                    (
                        cc2_methods::START_PRINT,
                        json!({ "filename": filename, "storage_media": storage.as_wire() }),
                    )
                } else {
                    (
                        legacy_methods::START_PRINT,
                        json!({ "Filename": filename, "StartLayer": 0 }),
                    )
                }
            }
            CommandKind::PausePrint => {
                if cc2 {
                    (cc2_methods::PAUSE_PRINT, json!({}))
                } else {
                    (legacy_methods::PAUSE_PRINT, json!({}))
                }
            }
            CommandKind::StopPrint => {
                if cc2 {
                    (cc2_methods::STOP_PRINT, json!({}))
                } else {
                    (legacy_methods::STOP_PRINT, json!({}))
                }
            }
            CommandKind::ResumePrint => {
                if cc2 {
                    (cc2_methods::RESUME_PRINT, json!({}))
                } else {
                    (legacy_methods::RESUME_PRINT, json!({}))
                }
            }
            CommandKind::SetNozzleTemp(temp) => {
                let temp = (*temp).min(320);
                if cc2 {
                    (cc2_methods::SET_TEMPERATURE, json!({ "extruder": temp }))
                } else {
                    (
                        legacy_methods::CONTROL_DEVICE,
                        json!({ "TempTargetNozzle": temp }),
                    )
                }
            }
            CommandKind::SetBedTemp(temp) => {
                let temp = (*temp).min(110);
                if cc2 {
                    (cc2_methods::SET_TEMPERATURE, json!({ "heater_bed": temp }))
                } else {
                    (
                        legacy_methods::CONTROL_DEVICE,
                        json!({ "TempTargetHotbed": temp }),
                    )
                }
            }
            CommandKind::SetFanSpeed { fan, duty } => {
                if cc2 {
                    let mut params = serde_json::Map::new();
                    params.insert(fan.cc2_key().to_string(), json!(duty));
                    (cc2_methods::SET_FAN_SPEED, Value::Object(params))
                } else {
                    // Legacy takes percentages.
                    let pct = (*duty as u32 * 100) / 255;
                    let mut speeds = serde_json::Map::new();
                    speeds.insert(fan.legacy_key().to_string(), json!(pct));
                    (
                        legacy_methods::CONTROL_DEVICE,
                        json!({ "TargetFanSpeed": speeds }),
                    )
                }
            }
            CommandKind::SetLight { on, rgb } => {
                if cc2 {
                    // Real CC2 firmware takes {"power": 0|1}; the documented
                    // brightness parameter is a no-op.
                    (
                        cc2_methods::SET_LIGHT,
                        json!({ "power": if *on { 1 } else { 0 } }),
                    )
                } else {
                    (
                        legacy_methods::CONTROL_DEVICE,
                        json!({ "LightStatus": {
                            "SecondLight": if *on { 1 } else { 0 },
                            "RgbLight": rgb.map(|c| vec![c[0], c[1], c[2]]).unwrap_or_default(),
                        }}),
                    )
                }
            }
            CommandKind::SetPrintSpeedMode(mode) => {
                if cc2 {
                    (
                        cc2_methods::SET_PRINT_SPEED,
                        json!({ "mode": mode.as_mode_index() }),
                    )
                } else {
                    let pct = match mode {
                        SpeedMode::Silent => 50,
                        SpeedMode::Balanced => 100,
                        SpeedMode::Sport => 150,
                        SpeedMode::Ludicrous => 200,
                    };
                    (
                        legacy_methods::CONTROL_DEVICE,
                        json!({ "PrintSpeedPct": pct }),
                    )
                }
            }
            CommandKind::EnableVideoStream { enable } => {
                let flag = if *enable { 1 } else { 0 };
                if cc2 {
                    (cc2_methods::SET_VIDEO_STREAM, json!({ "enable": flag }))
                } else {
                    (legacy_methods::SET_VIDEO_STREAM, json!({ "Enable": flag }))
                }
            }
            CommandKind::ListFiles { path } => {
                if cc2 {
                    (
                        cc2_methods::LIST_FILES,
                        json!({ "storage_media": "local", "path": path }),
                    )
                } else {
                    (legacy_methods::LIST_FILES, json!({ "Url": path }))
                }
            }
            CommandKind::GetFileDetail { filename, storage } => {
                if cc2 {
                    (
                        cc2_methods::GET_FILE_DETAIL,
                        json!({ "storage_media": storage.as_wire(), "filename": filename }),
                    )
                } else {
                    return unsupported("file detail");
                }
            }
            CommandKind::GetDiskInfo => {
                if cc2 {
                    (cc2_methods::GET_DISK_INFO, json!({}))
                } else {
                    return unsupported("disk info");
                }
            }
            CommandKind::GetCanvasStatus => {
                if cc2 {
                    (cc2_methods::GET_CANVAS_STATUS, json!({}))
                } else {
                    return unsupported("canvas status");
                }
            }
        };
        Ok(encoded)
    }
}
