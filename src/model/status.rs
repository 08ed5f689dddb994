//! The merged status snapshot and its per-dialect mapping.
//!
//! The session keeps the printer's raw status tree as JSON and rebuilds this
//! typed record after every merge. Fields the mapping does not know about are
//! preserved in `extra`, so deltas from newer firmware survive round-trips.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::enums::{MachineState, PrintError, PrintStage};

/// Hotend / bed / enclosure temperatures, °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Temperatures {
    pub nozzle: f64,
    pub nozzle_target: f64,
    pub bed: f64,
    pub bed_target: f64,
    pub enclosure: f64,
    pub enclosure_target: f64,
    /// Resin machines only.
    pub uv_led: f64,
}

/// Fan duty values. Always 0-255 at this layer, never percentages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FanSpeeds {
    pub model: u8,
    pub auxiliary: u8,
    pub enclosure: u8,
}

/// Chamber / secondary light state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LightState {
    pub on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rgb: Option<[u8; 3]>,
}

/// Toolhead position and z-offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolheadPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub z_offset: f64,
}

/// Progress of the active (or last) print job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrintProgress {
    pub stage: PrintStage,
    pub filename: String,
    /// Task uuid assigned by the printer.
    pub task_id: String,
    pub current_layer: u32,
    pub total_layers: u32,
    pub percent_complete: u8,
    pub print_duration_secs: u64,
    pub total_duration_secs: u64,
    pub speed_pct: u32,
    pub error: PrintError,
}

impl PrintProgress {
    /// Derive percent complete the way the firmware intends it.
    ///
    /// Finished prints report 0 for both percent and current layer, so
    /// Complete forces 100. When the percentage is missing, fall back to
    /// layer arithmetic.
    fn finalize(&mut self, machine: MachineState, reported_pct: Option<i64>) {
        if self.stage == PrintStage::Complete {
            self.percent_complete = 100;
            self.current_layer = self.total_layers;
            return;
        }
        if machine == MachineState::Idle {
            self.percent_complete = 0;
            return;
        }
        let pct = match reported_pct {
            Some(p) => p,
            None if self.total_layers > 0 => {
                (self.current_layer as i64 * 100) / self.total_layers as i64
            }
            None => 0,
        };
        self.percent_complete = pct.clamp(0, 100) as u8;
    }
}

/// Last-known full state of a printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    /// Sequence number attached by the printer; never decremented.
    pub last_update_id: u64,
    /// Transport was lost; values are the last known good state.
    pub stale: bool,
    /// Internally inconsistent (printing without a filename); a full refresh
    /// has been requested.
    pub tainted: bool,
    pub machine: MachineState,
    pub print: PrintProgress,
    pub temps: Temperatures,
    pub fans: FanSpeeds,
    pub light: LightState,
    pub position: ToolheadPosition,
    /// Canvas (multi-filament) tray list, verbatim from the printer.
    pub canvas_list: Vec<Value>,
    /// Outstanding exception records, verbatim.
    pub exceptions: Vec<Value>,
    /// Fields the typed mapping does not cover.
    pub extra: Map<String, Value>,
}

fn num(v: Option<&Value>) -> f64 {
    v.and_then(Value::as_f64).unwrap_or(0.0)
}

fn int(v: Option<&Value>) -> i64 {
    v.and_then(Value::as_i64).unwrap_or(0)
}

fn text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn duty_from_percent(pct: i64) -> u8 {
    ((pct.clamp(0, 100) * 255) / 100) as u8
}

fn rgb_triplet(v: Option<&Value>) -> Option<[u8; 3]> {
    let arr = v?.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    Some([
        arr[0].as_u64()? as u8,
        arr[1].as_u64()? as u8,
        arr[2].as_u64()? as u8,
    ])
}

impl StatusSnapshot {
    /// Build a snapshot from a CC2 status tree (full or merged).
    ///
    /// Field spellings vary between firmware revisions; both `print_status`
    /// and `print_job` blocks are accepted, as are `total_layer` and
    /// `total_layers`.
    pub fn from_cc2(tree: &Value, update_id: u64) -> Self {
        let obj = tree.as_object().cloned().unwrap_or_default();
        let machine = MachineState::from_code(int(obj.get("status")));

        let job = obj
            .get("print_status")
            .or_else(|| obj.get("print_job"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut print = PrintProgress {
            stage: PrintStage::from_code(int(
                job.get("sub_status").or_else(|| obj.get("sub_status")),
            )),
            filename: text(job.get("filename").or_else(|| job.get("file_name"))),
            task_id: text(job.get("uuid").or_else(|| job.get("task_id"))),
            current_layer: int(job.get("current_layer")).max(0) as u32,
            total_layers: int(job.get("total_layer").or_else(|| job.get("total_layers"))).max(0)
                as u32,
            print_duration_secs: int(job.get("print_duration").or_else(|| job.get("print_time")))
                .max(0) as u64,
            total_duration_secs: int(job.get("total_duration").or_else(|| job.get("total_time")))
                .max(0) as u64,
            speed_pct: int(obj.get("print_speed")).clamp(0, 1000) as u32,
            error: PrintError::from_code(int(job.get("error_code"))),
            ..Default::default()
        };
        let reported = job.get("progress").and_then(Value::as_i64);
        print.finalize(machine, reported);

        let fans = obj
            .get("fan_speeds")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let light = obj
            .get("light_status")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let pos = obj
            .get("position")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let known = [
            "status",
            "sub_status",
            "temp_extruder",
            "temp_extruder_target",
            "temp_heater_bed",
            "temp_heater_bed_target",
            "temp_box",
            "temp_box_target",
            "fan_speeds",
            "light_status",
            "position",
            "z_offset",
            "print_speed",
            "print_status",
            "print_job",
            "sequence",
            "canvas_info",
            "exception_status",
        ];
        let extra: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut snapshot = StatusSnapshot {
            last_update_id: update_id,
            stale: false,
            tainted: false,
            machine,
            print,
            temps: Temperatures {
                nozzle: num(obj.get("temp_extruder")),
                nozzle_target: num(obj.get("temp_extruder_target")),
                bed: num(obj.get("temp_heater_bed")),
                bed_target: num(obj.get("temp_heater_bed_target")),
                enclosure: num(obj.get("temp_box")),
                enclosure_target: num(obj.get("temp_box_target")),
                uv_led: 0.0,
            },
            fans: FanSpeeds {
                // CC2 already reports 0-255 duty values.
                model: int(fans.get("fan")).clamp(0, 255) as u8,
                auxiliary: int(fans.get("aux_fan")).clamp(0, 255) as u8,
                enclosure: int(fans.get("box_fan")).clamp(0, 255) as u8,
            },
            light: LightState {
                on: int(light.get("enabled").or_else(|| light.get("power"))) != 0,
                rgb: rgb_triplet(light.get("rgb")),
            },
            position: ToolheadPosition {
                x: num(pos.get("x")),
                y: num(pos.get("y")),
                z: num(pos.get("z")),
                z_offset: num(obj.get("z_offset")),
            },
            canvas_list: obj
                .get("canvas_info")
                .and_then(|c| c.get("canvas_list"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            exceptions: obj
                .get("exception_status")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            extra,
        };
        snapshot.check_consistency();
        snapshot
    }

    /// Build a snapshot from a WebSocket-SDCP `Status` tree.
    pub fn from_sdcp(tree: &Value, update_id: u64, fdm: bool) -> Self {
        let status = tree
            .get("Status")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(|| tree.as_object().cloned().unwrap_or_default());

        let machine = status
            .get("CurrentStatus")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_i64)
            .map(MachineState::from_code)
            .unwrap_or_default();

        let info = status
            .get("PrintInfo")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // Legacy FDM firmware reports ticks in seconds, resin in ms.
        let tick_scale = if fdm { 1 } else { 1000 };
        let mut print = PrintProgress {
            stage: PrintStage::from_code(int(info.get("Status"))),
            filename: text(info.get("Filename")),
            task_id: text(info.get("TaskId")),
            current_layer: int(info.get("CurrentLayer")).max(0) as u32,
            total_layers: int(info.get("TotalLayer").or_else(|| info.get("TotalLayers"))).max(0)
                as u32,
            print_duration_secs: (int(info.get("CurrentTicks")).max(0) as u64) / tick_scale,
            total_duration_secs: (int(info.get("TotalTicks")).max(0) as u64) / tick_scale,
            speed_pct: int(info.get("PrintSpeedPct")).clamp(0, 1000).max(0) as u32,
            error: PrintError::from_code(int(info.get("ErrorNumber"))),
            ..Default::default()
        };
        let reported = info.get("Progress").and_then(Value::as_i64);
        print.finalize(machine, reported);

        let fans = status
            .get("CurrentFanSpeed")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let light = status
            .get("LightStatus")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // "x,y,z" string on this dialect.
        let coord = text(status.get("CurrenCoord"));
        let mut axes = coord.split(',').map(|c| c.trim().parse::<f64>().unwrap_or(0.0));
        let (x, y, z) = (
            axes.next().unwrap_or(0.0),
            axes.next().unwrap_or(0.0),
            axes.next().unwrap_or(0.0),
        );

        let known = [
            "CurrentStatus",
            "PreviousStatus",
            "PrintInfo",
            "CurrentFanSpeed",
            "LightStatus",
            "CurrenCoord",
            "ZOffset",
            "TempOfNozzle",
            "TempTargetNozzle",
            "TempOfHotbed",
            "TempTargetHotbed",
            "TempOfBox",
            "TempTargetBox",
            "TempOfUVLED",
        ];
        let extra: Map<String, Value> = status
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut snapshot = StatusSnapshot {
            last_update_id: update_id,
            stale: false,
            tainted: false,
            machine,
            print,
            temps: Temperatures {
                nozzle: num(status.get("TempOfNozzle")),
                nozzle_target: num(status.get("TempTargetNozzle")),
                bed: num(status.get("TempOfHotbed")),
                bed_target: num(status.get("TempTargetHotbed")),
                enclosure: num(status.get("TempOfBox")),
                enclosure_target: num(status.get("TempTargetBox")),
                uv_led: num(status.get("TempOfUVLED")),
            },
            fans: FanSpeeds {
                // Legacy dialect reports percentages.
                model: duty_from_percent(int(fans.get("ModelFan"))),
                auxiliary: duty_from_percent(int(fans.get("AuxiliaryFan"))),
                enclosure: duty_from_percent(int(fans.get("BoxFan"))),
            },
            light: LightState {
                on: int(light.get("SecondLight")) != 0,
                rgb: rgb_triplet(light.get("RgbLight")),
            },
            position: ToolheadPosition {
                x,
                y,
                z,
                z_offset: num(status.get("ZOffset")),
            },
            canvas_list: Vec::new(),
            exceptions: Vec::new(),
            extra,
        };
        snapshot.check_consistency();
        snapshot
    }

    /// A printing machine must name its job. If it does not, the snapshot is
    /// marked tainted and the session requests a full refresh.
    fn check_consistency(&mut self) {
        if self.machine == MachineState::Printing
            && (self.print.filename.is_empty() || self.print.task_id.is_empty())
        {
            self.tainted = true;
        }
    }

    /// Whether the job just entered a printing state without a known layer
    /// count, which triggers the file-detail recovery query.
    pub fn needs_layer_recovery(&self) -> bool {
        self.machine == MachineState::Printing
            && !self.print.filename.is_empty()
            && self.print.total_layers == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cc2_tree_maps_to_snapshot() {
        let tree = json!({
            "status": 1,
            "temp_extruder": 210.4,
            "temp_extruder_target": 215.0,
            "temp_heater_bed": 60.1,
            "temp_heater_bed_target": 60.0,
            "fan_speeds": {"fan": 255, "aux_fan": 128, "box_fan": 0},
            "light_status": {"enabled": 1, "rgb": [255, 255, 255]},
            "position": {"x": 10.0, "y": 20.0, "z": 0.4},
            "z_offset": -0.02,
            "print_speed": 100,
            "print_status": {
                "sub_status": 3,
                "filename": "benchy.gcode",
                "uuid": "task-1",
                "current_layer": 50,
                "total_layer": 200,
                "print_duration": 1200,
                "total_duration": 4800,
                "progress": 25
            },
            "future_field": {"whatever": true}
        });
        let snap = StatusSnapshot::from_cc2(&tree, 7);
        assert_eq!(snap.last_update_id, 7);
        assert_eq!(snap.machine, MachineState::Printing);
        assert_eq!(snap.print.stage, PrintStage::Printing);
        assert_eq!(snap.print.filename, "benchy.gcode");
        assert_eq!(snap.print.total_layers, 200);
        assert_eq!(snap.print.percent_complete, 25);
        assert_eq!(snap.fans.model, 255);
        assert_eq!(snap.fans.auxiliary, 128);
        assert!(snap.light.on);
        assert!(!snap.tainted);
        assert!(snap.extra.contains_key("future_field"));
    }

    #[test]
    fn printing_without_filename_taints() {
        let tree = json!({
            "status": 1,
            "print_status": {"sub_status": 3, "filename": "", "uuid": ""}
        });
        let snap = StatusSnapshot::from_cc2(&tree, 1);
        assert!(snap.tainted);
    }

    #[test]
    fn sdcp_tree_maps_and_scales_fans() {
        let tree = json!({
            "Status": {
                "CurrentStatus": [1],
                "TempOfNozzle": 205.0,
                "TempTargetNozzle": 210.0,
                "TempOfHotbed": 55.0,
                "TempTargetHotbed": 60.0,
                "CurrenCoord": "1.5,2.5,3.5",
                "ZOffset": 0.1,
                "CurrentFanSpeed": {"ModelFan": 100, "AuxiliaryFan": 50, "BoxFan": 0},
                "LightStatus": {"SecondLight": 1},
                "PrintInfo": {
                    "Status": 3,
                    "CurrentLayer": 10,
                    "TotalLayer": 100,
                    "CurrentTicks": 60,
                    "TotalTicks": 600,
                    "Filename": "tower.gcode",
                    "TaskId": "abc",
                    "ErrorNumber": 0
                }
            }
        });
        let snap = StatusSnapshot::from_sdcp(&tree, 42, true);
        assert_eq!(snap.fans.model, 255);
        assert_eq!(snap.fans.auxiliary, 127);
        assert_eq!(snap.position.y, 2.5);
        assert_eq!(snap.print.percent_complete, 10);
        assert_eq!(snap.print.print_duration_secs, 60);
        assert!(!snap.tainted);
    }

    #[test]
    fn complete_forces_hundred_percent() {
        let tree = json!({
            "status": 0,
            "print_status": {
                "sub_status": 9,
                "filename": "done.gcode",
                "uuid": "t",
                "current_layer": 0,
                "total_layer": 300,
                "progress": 0
            }
        });
        let snap = StatusSnapshot::from_cc2(&tree, 1);
        assert_eq!(snap.print.percent_complete, 100);
        assert_eq!(snap.print.current_layer, 300);
    }

    #[test]
    fn layer_recovery_trigger() {
        let tree = json!({
            "status": 1,
            "print_status": {
                "sub_status": 3,
                "filename": "benchy.gcode",
                "uuid": "t1",
                "total_layer": 0
            }
        });
        let snap = StatusSnapshot::from_cc2(&tree, 1);
        assert!(snap.needs_layer_recovery());
    }
}
