//! Typed printer state enums.
//!
//! Wire values come from the SDCP status tree; unknown integers never fail a
//! parse, they fall back to a safe default so future firmware keeps working.

use serde::{Deserialize, Serialize};

/// Top-level machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    #[default]
    Idle,
    Printing,
    FileTransferring,
    ExposureTesting,
    DevicesTesting,
    Leveling,
    Homing,
    LoadingUnloading,
    Unknown,
}

impl MachineState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MachineState::Idle,
            1 => MachineState::Printing,
            2 => MachineState::FileTransferring,
            3 => MachineState::ExposureTesting,
            4 => MachineState::DevicesTesting,
            5 => MachineState::Leveling,
            9 => MachineState::Homing,
            10 => MachineState::LoadingUnloading,
            _ => MachineState::Unknown,
        }
    }
}

/// Print-job sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrintStage {
    #[default]
    Idle,
    Homing,
    Dropping,
    Printing,
    Lifting,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Complete,
    FileChecking,
    Recovery,
    Loading,
    Preheating,
    Leveling,
    Unknown,
}

impl PrintStage {
    /// Firmware aliases: 13 reports as Printing, 18/19/21 as Loading.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PrintStage::Idle,
            1 => PrintStage::Homing,
            2 => PrintStage::Dropping,
            3 | 13 => PrintStage::Printing,
            4 => PrintStage::Lifting,
            5 => PrintStage::Pausing,
            6 => PrintStage::Paused,
            7 => PrintStage::Stopping,
            8 => PrintStage::Stopped,
            9 => PrintStage::Complete,
            10 => PrintStage::FileChecking,
            12 => PrintStage::Recovery,
            15 | 18 | 19 | 21 => PrintStage::Loading,
            16 => PrintStage::Preheating,
            20 => PrintStage::Leveling,
            _ => PrintStage::Unknown,
        }
    }
}

/// Print-file error reported by the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrintError {
    #[default]
    None,
    Md5Check,
    FileIo,
    InvalidResolution,
    UnknownFormat,
    UnknownModel,
    Unknown,
}

impl PrintError {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PrintError::None,
            1 => PrintError::Md5Check,
            2 => PrintError::FileIo,
            3 => PrintError::InvalidResolution,
            4 => PrintError::UnknownFormat,
            5 => PrintError::UnknownModel,
            _ => PrintError::Unknown,
        }
    }
}

/// Video stream ack from the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoAck {
    Ok,
    MaxStreams,
    NoCamera,
    Unknown,
}

impl VideoAck {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => VideoAck::Ok,
            1 => VideoAck::MaxStreams,
            2 => VideoAck::NoCamera,
            _ => VideoAck::Unknown,
        }
    }
}

/// Fans addressable on FDM machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanId {
    Model,
    Auxiliary,
    Box,
}

impl FanId {
    /// Key used in legacy `TargetFanSpeed` maps.
    pub fn legacy_key(self) -> &'static str {
        match self {
            FanId::Model => "ModelFan",
            FanId::Auxiliary => "AuxiliaryFan",
            FanId::Box => "BoxFan",
        }
    }

    /// Key used in CC2 fan-control params.
    pub fn cc2_key(self) -> &'static str {
        match self {
            FanId::Model => "fan",
            FanId::Auxiliary => "aux_fan",
            FanId::Box => "box_fan",
        }
    }
}

/// CC2 print speed modes. The printer takes a mode index, not a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedMode {
    Silent,
    Balanced,
    Sport,
    Ludicrous,
}

impl SpeedMode {
    pub fn as_mode_index(self) -> u8 {
        match self {
            SpeedMode::Silent => 0,
            SpeedMode::Balanced => 1,
            SpeedMode::Sport => 2,
            SpeedMode::Ludicrous => 3,
        }
    }

    /// Closest mode for a requested speed percentage.
    pub fn from_percentage(pct: u32) -> Self {
        match pct {
            0..=75 => SpeedMode::Silent,
            76..=125 => SpeedMode::Balanced,
            126..=175 => SpeedMode::Sport,
            _ => SpeedMode::Ludicrous,
        }
    }
}
