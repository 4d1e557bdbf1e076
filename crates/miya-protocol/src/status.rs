//! Semantic interpretation of status frames

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::frame::{FrameView, StandardFrame};
use crate::types::FunctionCode;

/// Operating mode reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Off,
    Auto,
    Manual,
    Unknown,
}

impl PowerMode {
    /// Byte 5 decides on/off; byte 10 only matters while powered on
    #[must_use]
    pub fn from_bytes(power: u8, auto_manual: u8) -> Self {
        match (power, auto_manual) {
            (0x01, _) => PowerMode::Off,
            (0x02, 0x01) => PowerMode::Auto,
            (0x02, 0x02) => PowerMode::Manual,
            _ => PowerMode::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PowerMode::Off => "off",
            PowerMode::Auto => "auto",
            PowerMode::Manual => "manual",
            PowerMode::Unknown => "unknown",
        }
    }
}

/// Fan speed, reported only when supply and exhaust run at the same level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FanMode {
    #[serde(rename = "level_1")]
    Level1,
    #[serde(rename = "level_2")]
    Level2,
    #[serde(rename = "level_3")]
    Level3,
    #[serde(rename = "level_4")]
    Level4,
    #[serde(rename = "level_5")]
    Level5,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FanMode {
    #[must_use]
    pub fn from_bytes(fan_in: u8, fan_out: u8) -> Self {
        if fan_in != fan_out {
            return FanMode::Unknown;
        }
        match fan_in {
            0x01 => FanMode::Level1,
            0x02 => FanMode::Level2,
            0x03 => FanMode::Level3,
            0x04 => FanMode::Level4,
            0x05 => FanMode::Level5,
            _ => FanMode::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FanMode::Level1 => "level_1",
            FanMode::Level2 => "level_2",
            FanMode::Level3 => "level_3",
            FanMode::Level4 => "level_4",
            FanMode::Level5 => "level_5",
            FanMode::Unknown => "unknown",
        }
    }
}

/// Two-state feature flag (0x01 off, 0x02 on)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Toggle {
    On,
    Off,
    Unknown,
}

impl Toggle {
    #[must_use]
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x01 => Toggle::Off,
            0x02 => Toggle::On,
            _ => Toggle::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Toggle::On => "on",
            Toggle::Off => "off",
            Toggle::Unknown => "unknown",
        }
    }
}

macro_rules! impl_display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

impl_display_as_str!(PowerMode, FanMode, Toggle);

/// Decoded device state from one standard frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub mode: PowerMode,
    pub fan_mode: FanMode,
    pub negative_ion: Toggle,
    pub sleep_mode: Toggle,
    #[serde(rename = "UV_sterilization")]
    pub uv_sterilization: Toggle,
    pub inner_cycle: Toggle,
    pub auxiliary_heat: Toggle,
    pub bypass: Toggle,
}

impl StatusSnapshot {
    /// Interpret the data bytes of a standard frame
    #[must_use]
    pub fn from_frame(frame: &StandardFrame) -> Self {
        Self {
            mode: PowerMode::from_bytes(frame.power(), frame.auto_manual()),
            fan_mode: FanMode::from_bytes(frame.fan_in(), frame.fan_out()),
            negative_ion: Toggle::from_byte(frame.negative_ion()),
            sleep_mode: Toggle::from_byte(frame.sleep_mode()),
            uv_sterilization: Toggle::from_byte(frame.uv_sterilization()),
            inner_cycle: Toggle::from_byte(frame.inner_cycle()),
            auxiliary_heat: Toggle::from_byte(frame.auxiliary_heat()),
            bypass: Toggle::from_byte(frame.bypass()),
        }
    }

    /// Flat key/value view, keyed the way the home-automation side expects
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("mode", self.mode.as_str()),
            ("fan_mode", self.fan_mode.as_str()),
            ("negative_ion", self.negative_ion.as_str()),
            ("sleep_mode", self.sleep_mode.as_str()),
            ("UV_sterilization", self.uv_sterilization.as_str()),
            ("inner_cycle", self.inner_cycle.as_str()),
            ("auxiliary_heat", self.auxiliary_heat.as_str()),
            ("bypass", self.bypass.as_str()),
        ])
    }

    /// Fields that differ from `previous`, keyed as in [`Self::to_map`]
    #[must_use]
    pub fn changes_since(&self, previous: &StatusSnapshot) -> Vec<FieldChange> {
        previous
            .to_map()
            .into_iter()
            .zip(self.to_map())
            .filter(|((_, before), (_, after))| before != after)
            .map(|((field, previous), (_, current))| FieldChange {
                field,
                previous,
                current,
            })
            .collect()
    }
}

/// One status field that changed between two reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub previous: &'static str,
    pub current: &'static str,
}

/// Frame that carries no interpretable status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsupported {
    pub kind: &'static str,
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no status in {} frame", self.kind)
    }
}

impl std::error::Error for Unsupported {}

/// Map a decoded frame to a status snapshot
///
/// Defined for standard query responses and control acknowledgements.
/// CRC validity is not checked here; callers filter invalid frames first.
pub fn interpret(view: &FrameView) -> Result<StatusSnapshot, Unsupported> {
    match view {
        FrameView::Standard(frame)
            if matches!(frame.function(), FunctionCode::Query | FunctionCode::Control) =>
        {
            Ok(StatusSnapshot::from_frame(frame))
        }
        other => Err(Unsupported { kind: other.kind() }),
    }
}
