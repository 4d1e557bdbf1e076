//! MIYA HRV command catalog
//!
//! Every control command is a sparse delta: all control bytes are 0x00
//! ("leave unchanged") except the one field being set. Address bytes are
//! zero in the templates and the CRC is left off; both are filled in by
//! [`CommandTable::resolve_all`]. [`ControlFrame`] builds the same kind of
//! delta for any combination of fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::{offset, resolve_command, CRC_OFFSET, HEADER, PAYLOAD_LEN, STANDARD_FRAME_LEN};
use crate::types::{FunctionCode, ProtocolError};

/// Command names understood by [`CommandTable`]
pub mod names {
    pub const POWER_OFF: &str = "power_off";
    pub const POWER_AUTO: &str = "power_auto";
    pub const POWER_MANUAL: &str = "power_manual";
    pub const FAN_MODE_LEVEL_1: &str = "fan_mode_level_1";
    pub const FAN_MODE_LEVEL_2: &str = "fan_mode_level_2";
    pub const FAN_MODE_LEVEL_3: &str = "fan_mode_level_3";
    pub const NEGATIVE_ION_ON: &str = "negative_ion_on";
    pub const NEGATIVE_ION_OFF: &str = "negative_ion_off";
    pub const SLEEP_MODE_ON: &str = "sleep_mode_on";
    pub const SLEEP_MODE_OFF: &str = "sleep_mode_off";
    pub const UV_STERILIZATION_ON: &str = "uv_sterilization_on";
    pub const UV_STERILIZATION_OFF: &str = "uv_sterilization_off";
    pub const INNER_CYCLE_ON: &str = "inner_cycle_on";
    pub const INNER_CYCLE_OFF: &str = "inner_cycle_off";
    pub const AUXILIARY_HEAT_ON: &str = "auxiliary_heat_on";
    pub const AUXILIARY_HEAT_OFF: &str = "auxiliary_heat_off";
    pub const BYPASS_ON: &str = "bypass_on";
    pub const BYPASS_OFF: &str = "bypass_off";
    pub const STATUS_QUERY: &str = "status_query";
}

/// Field values used in control templates
const OFF: u8 = 0x01;
const ON: u8 = 0x02;
const AUTO: u8 = 0x01;
const MANUAL: u8 = 0x02;

/// A named, address-unbound, CRC-unbound command prototype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTemplate {
    pub name: &'static str,
    pub bytes: [u8; CRC_OFFSET],
}

impl CommandTemplate {
    /// Control template that sets the given `(offset, value)` fields
    const fn control(name: &'static str, fields: &[(usize, u8)]) -> Self {
        let mut bytes = [0u8; CRC_OFFSET];
        bytes[offset::HEADER] = HEADER;
        bytes[offset::LENGTH] = PAYLOAD_LEN;
        bytes[offset::FUNCTION] = FunctionCode::CONTROL;
        let mut i = 0;
        while i < fields.len() {
            bytes[fields[i].0] = fields[i].1;
            i += 1;
        }
        Self { name, bytes }
    }

    /// Status query: function 0x01 with an all-zero payload
    const fn query(name: &'static str) -> Self {
        let mut bytes = [0u8; CRC_OFFSET];
        bytes[offset::HEADER] = HEADER;
        bytes[offset::LENGTH] = PAYLOAD_LEN;
        bytes[offset::FUNCTION] = FunctionCode::QUERY;
        Self { name, bytes }
    }
}

/// Every command the integration can send
///
/// Fan levels use the raw speed values the controller accepts from the wall
/// panel (0x02..=0x04); a status frame reports them back as those same raw
/// values.
pub const CATALOG: &[CommandTemplate] = &[
    CommandTemplate::control(names::POWER_OFF, &[(offset::POWER, OFF)]),
    CommandTemplate::control(
        names::POWER_AUTO,
        &[(offset::POWER, ON), (offset::AUTO_MANUAL, AUTO)],
    ),
    CommandTemplate::control(
        names::POWER_MANUAL,
        &[(offset::POWER, ON), (offset::AUTO_MANUAL, MANUAL)],
    ),
    CommandTemplate::control(
        names::FAN_MODE_LEVEL_1,
        &[(offset::FAN_IN, 0x02), (offset::FAN_OUT, 0x02)],
    ),
    CommandTemplate::control(
        names::FAN_MODE_LEVEL_2,
        &[(offset::FAN_IN, 0x03), (offset::FAN_OUT, 0x03)],
    ),
    CommandTemplate::control(
        names::FAN_MODE_LEVEL_3,
        &[(offset::FAN_IN, 0x04), (offset::FAN_OUT, 0x04)],
    ),
    CommandTemplate::control(names::NEGATIVE_ION_ON, &[(offset::NEGATIVE_ION, ON)]),
    CommandTemplate::control(names::NEGATIVE_ION_OFF, &[(offset::NEGATIVE_ION, OFF)]),
    CommandTemplate::control(names::SLEEP_MODE_ON, &[(offset::SLEEP_MODE, ON)]),
    CommandTemplate::control(names::SLEEP_MODE_OFF, &[(offset::SLEEP_MODE, OFF)]),
    CommandTemplate::control(
        names::UV_STERILIZATION_ON,
        &[(offset::UV_STERILIZATION, ON)],
    ),
    CommandTemplate::control(
        names::UV_STERILIZATION_OFF,
        &[(offset::UV_STERILIZATION, OFF)],
    ),
    CommandTemplate::control(names::INNER_CYCLE_ON, &[(offset::INNER_CYCLE, ON)]),
    CommandTemplate::control(names::INNER_CYCLE_OFF, &[(offset::INNER_CYCLE, OFF)]),
    CommandTemplate::control(names::AUXILIARY_HEAT_ON, &[(offset::AUXILIARY_HEAT, ON)]),
    CommandTemplate::control(names::AUXILIARY_HEAT_OFF, &[(offset::AUXILIARY_HEAT, OFF)]),
    CommandTemplate::control(names::BYPASS_ON, &[(offset::BYPASS, ON)]),
    CommandTemplate::control(names::BYPASS_OFF, &[(offset::BYPASS, OFF)]),
    CommandTemplate::query(names::STATUS_QUERY),
];

/// Look up a template in the static catalog
#[must_use]
pub fn template(name: &str) -> Option<&'static CommandTemplate> {
    CATALOG.iter().find(|t| t.name == name)
}

/// Highest raw fan speed the controller accepts
pub const MAX_FAN_SPEED: u8 = 0x05;

/// Control frame that sets several fields in one write
///
/// Fields left as `None` go out as 0x00 and stay unchanged on the unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlFrame {
    pub power: Option<bool>,
    /// `true` for automatic, `false` for manual
    pub auto_mode: Option<bool>,
    /// Raw speed (1..=5) for both supply and exhaust fans
    pub fan_speed: Option<u8>,
    pub negative_ion: Option<bool>,
    pub sleep_mode: Option<bool>,
    pub uv_sterilization: Option<bool>,
    pub inner_cycle: Option<bool>,
    pub auxiliary_heat: Option<bool>,
    pub bypass: Option<bool>,
    pub timer: Option<bool>,
}

impl ControlFrame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the frame would change nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Address-unbound bytes of the frame, without CRC
    pub fn template(&self) -> Result<[u8; CRC_OFFSET], ProtocolError> {
        let mut bytes = CommandTemplate::control("control", &[]).bytes;

        let switches = [
            (offset::POWER, self.power),
            (offset::NEGATIVE_ION, self.negative_ion),
            (offset::SLEEP_MODE, self.sleep_mode),
            (offset::UV_STERILIZATION, self.uv_sterilization),
            (offset::INNER_CYCLE, self.inner_cycle),
            (offset::AUXILIARY_HEAT, self.auxiliary_heat),
            (offset::BYPASS, self.bypass),
            (offset::TIMER, self.timer),
        ];
        for (at, value) in switches {
            if let Some(on) = value {
                bytes[at] = if on { ON } else { OFF };
            }
        }

        if let Some(auto) = self.auto_mode {
            bytes[offset::AUTO_MANUAL] = if auto { AUTO } else { MANUAL };
        }

        if let Some(speed) = self.fan_speed {
            if !(1..=MAX_FAN_SPEED).contains(&speed) {
                return Err(ProtocolError::Validation(format!(
                    "fan speed must be 1..={MAX_FAN_SPEED}, got {speed}"
                )));
            }
            bytes[offset::FAN_IN] = speed;
            bytes[offset::FAN_OUT] = speed;
        }

        Ok(bytes)
    }

    /// Fully formed frame for `device_addr`
    pub fn resolve(&self, device_addr: u8) -> Result<[u8; STANDARD_FRAME_LEN], ProtocolError> {
        resolve_command(&self.template()?, device_addr)
    }
}

/// Command frames resolved for one device address
///
/// Built once per device and then only read.
#[derive(Debug, Clone)]
pub struct CommandTable {
    address: u8,
    frames: BTreeMap<&'static str, [u8; STANDARD_FRAME_LEN]>,
}

impl CommandTable {
    /// Resolve every catalog template for `device_addr`
    pub fn resolve_all(device_addr: u8) -> Result<Self, ProtocolError> {
        Self::resolve_templates(CATALOG, device_addr)
    }

    /// Resolve an arbitrary set of templates for `device_addr`
    pub fn resolve_templates(
        templates: &[CommandTemplate],
        device_addr: u8,
    ) -> Result<Self, ProtocolError> {
        let frames = templates
            .iter()
            .map(|t| Ok((t.name, resolve_command(&t.bytes, device_addr)?)))
            .collect::<Result<BTreeMap<_, _>, ProtocolError>>()?;

        tracing::debug!(
            "Resolved {} commands for device address {:#04x}",
            frames.len(),
            device_addr
        );

        Ok(Self {
            address: device_addr,
            frames,
        })
    }

    /// Bus address the table was resolved for
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Fully formed frame for a command name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8; STANDARD_FRAME_LEN]> {
        self.frames.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.frames.contains_key(name)
    }

    /// Command names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.frames.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[u8; STANDARD_FRAME_LEN])> {
        self.frames.iter().map(|(name, frame)| (*name, frame))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
