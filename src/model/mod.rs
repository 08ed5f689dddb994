//! Data model: printer identity, status snapshot, attributes.

pub mod attributes;
pub mod enums;
pub mod status;

pub use attributes::Attributes;
pub use enums::{FanId, MachineState, PrintError, PrintStage, SpeedMode, VideoAck};
pub use status::{FanSpeeds, LightState, PrintProgress, StatusSnapshot, Temperatures, ToolheadPosition};

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which wire dialect a printer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// Full-duplex JSON over `ws://<ip>:3030/websocket`.
    WebsocketSdcp,
    /// Centauri Carbon 2: printer hosts the MQTT broker.
    MqttCc2,
    /// CC1-era: host runs the broker, printer is redirected to it.
    MqttLegacy,
}

/// Resin vs FDM machine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterFamily {
    Resin,
    Fdm,
}

/// Capability tags attached at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Video,
    Ams,
    Thumbnail,
    /// CC2 reported `lan_status == 0`; sessions are refused.
    CloudOnly,
}

/// Immutable printer identity produced by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// User-facing label.
    pub name: String,
    pub model: String,
    /// Serial / mainboard id; unique per machine.
    pub serial: String,
    pub ip_address: IpAddr,
    pub firmware: String,
    pub protocol_version: String,
    pub protocol: ProtocolKind,
    pub family: PrinterFamily,
    pub capabilities: BTreeSet<Capability>,
}

impl Identity {
    /// Whether a session may be opened against this printer.
    pub fn is_connectable(&self) -> bool {
        !self.capabilities.contains(&Capability::CloudOnly)
    }

    /// Upstream MJPEG URL for this machine, if it has a camera.
    pub fn video_url(&self) -> Option<String> {
        if !self.capabilities.contains(&Capability::Video) {
            return None;
        }
        let port = match self.protocol {
            ProtocolKind::MqttCc2 => 8080,
            _ => 3031,
        };
        Some(format!("http://{}:{}/?action=stream", self.ip_address, port))
    }
}

/// Infer the machine family from the model string.
///
/// Resin machines are the Saturn/Mars/Jupiter lines; everything Centauri,
/// Neptune or OrangeStorm extrudes filament. Unknown models default to FDM,
/// which is the safer assumption for new hardware.
pub fn infer_family(model: &str) -> PrinterFamily {
    const RESIN_PREFIXES: &[&str] = &["saturn", "mars", "jupiter"];
    const FDM_PREFIXES: &[&str] = &["centauri", "neptune", "orangestorm", "orange storm"];

    let lowered = model.to_lowercase();
    if RESIN_PREFIXES.iter().any(|p| lowered.contains(p)) {
        return PrinterFamily::Resin;
    }
    if FDM_PREFIXES.iter().any(|p| lowered.contains(p)) {
        return PrinterFamily::Fdm;
    }
    PrinterFamily::Fdm
}

/// Default capability set for a model/protocol combination.
pub fn infer_capabilities(model: &str, protocol: ProtocolKind) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::new();
    caps.insert(Capability::Thumbnail);
    match infer_family(model) {
        PrinterFamily::Fdm => {
            caps.insert(Capability::Video);
        }
        PrinterFamily::Resin => {}
    }
    if protocol == ProtocolKind::MqttCc2 {
        // Canvas (multi-filament) only exists on the CC2 line.
        caps.insert(Capability::Video);
        caps.insert(Capability::Ams);
    }
    caps
}

/// Where a print file lives on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMedium {
    #[default]
    Local,
    Udisk,
    Sdcard,
}

impl StorageMedium {
    pub fn as_wire(self) -> &'static str {
        match self {
            StorageMedium::Local => "local",
            StorageMedium::Udisk => "udisk",
            StorageMedium::Sdcard => "sdcard",
        }
    }
}

/// A printable file as listed by the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrintFileRecord {
    pub filename: String,
    pub storage: StorageMedium,
    pub size: u64,
    pub md5: String,
    pub total_layers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

/// Video stream handle returned by `EnableVideoStream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFeed {
    pub ack: VideoAck,
    pub url: String,
}
