//! Static-per-boot printer metadata.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attributes reported once at session open (and again on reconnect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Attributes {
    pub name: String,
    pub model: String,
    pub firmware: String,
    pub mainboard_mac: String,
    pub resolution: String,
    pub build_volume: String,
    pub network_type: String,
    pub usb_attached: bool,
    pub camera_attached: bool,
    pub video_connections: u32,
    pub max_video_connections: u32,
    pub remaining_memory: u64,
    /// Unmapped attribute fields, kept verbatim.
    pub extra: Map<String, Value>,
}

fn text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn int(v: Option<&Value>) -> i64 {
    v.and_then(Value::as_i64).unwrap_or(0)
}

impl Attributes {
    /// Parse a CC2 attributes result (snake_case keys).
    pub fn from_cc2(tree: &Value) -> Self {
        let obj = tree.as_object().cloned().unwrap_or_default();
        let known = [
            "host_name",
            "machine_model",
            "firmware_version",
            "mac",
            "resolution",
            "xyz_size",
            "network_type",
            "usb_connected",
            "camera_connected",
            "video_connections",
            "max_video_connections",
            "remaining_memory",
        ];
        Attributes {
            name: text(obj.get("host_name")),
            model: text(obj.get("machine_model")),
            firmware: text(obj.get("firmware_version")),
            mainboard_mac: text(obj.get("mac")),
            resolution: text(obj.get("resolution")),
            build_volume: text(obj.get("xyz_size")),
            network_type: text(obj.get("network_type")),
            usb_attached: obj
                .get("usb_connected")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            camera_attached: obj
                .get("camera_connected")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            video_connections: int(obj.get("video_connections")).max(0) as u32,
            max_video_connections: int(obj.get("max_video_connections")).max(0) as u32,
            remaining_memory: int(obj.get("remaining_memory")).max(0) as u64,
            extra: obj
                .iter()
                .filter(|(k, _)| !known.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Parse a legacy `Attributes` tree (PascalCase keys).
    pub fn from_sdcp(tree: &Value) -> Self {
        let obj = tree
            .get("Attributes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(|| tree.as_object().cloned().unwrap_or_default());
        let known = [
            "Name",
            "MachineName",
            "FirmwareVersion",
            "MainboardMAC",
            "Resolution",
            "XYZsize",
            "NetworkStatus",
            "UsbDiskStatus",
            "Capabilities",
            "NumberOfVideoStreamConnected",
            "MaximumVideoStreamAllowed",
            "RemainingMemory",
        ];
        Attributes {
            name: text(obj.get("Name")),
            model: text(obj.get("MachineName")),
            firmware: text(obj.get("FirmwareVersion")),
            mainboard_mac: text(obj.get("MainboardMAC")),
            resolution: text(obj.get("Resolution")),
            build_volume: text(obj.get("XYZsize")),
            network_type: text(obj.get("NetworkStatus")),
            usb_attached: int(obj.get("UsbDiskStatus")) != 0,
            camera_attached: obj
                .get("Capabilities")
                .and_then(Value::as_array)
                .map(|caps| caps.iter().any(|c| c.as_str() == Some("VIDEO_STREAM")))
                .unwrap_or(false),
            video_connections: int(obj.get("NumberOfVideoStreamConnected")).max(0) as u32,
            max_video_connections: int(obj.get("MaximumVideoStreamAllowed")).max(0) as u32,
            remaining_memory: int(obj.get("RemainingMemory")).max(0) as u64,
            extra: obj
                .iter()
                .filter(|(k, _)| !known.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cc2_attributes_parse() {
        let tree = json!({
            "host_name": "CC2",
            "machine_model": "Centauri Carbon 2",
            "firmware_version": "V1.1.32",
            "mac": "00:11:22:33:44:55",
            "resolution": "1920x1080",
            "xyz_size": "300x300x300",
            "max_video_connections": 2,
            "mystery": 42
        });
        let attrs = Attributes::from_cc2(&tree);
        assert_eq!(attrs.model, "Centauri Carbon 2");
        assert_eq!(attrs.max_video_connections, 2);
        assert!(attrs.extra.contains_key("mystery"));
    }

    #[test]
    fn sdcp_attributes_parse() {
        let tree = json!({
            "Attributes": {
                "Name": "Saturn",
                "MachineName": "Saturn 4 Ultra",
                "FirmwareVersion": "V3.0.1",
                "Capabilities": ["FILE_TRANSFER", "VIDEO_STREAM"],
                "MaximumVideoStreamAllowed": 1
            }
        });
        let attrs = Attributes::from_sdcp(&tree);
        assert_eq!(attrs.model, "Saturn 4 Ultra");
        assert!(attrs.camera_attached);
        assert_eq!(attrs.max_video_connections, 1);
    }
}
