//! Measurable channels exposed by a KACO inverter.
//!
//! Each [`Channel`] carries its physical unit, the cadence it is polled at,
//! and the configuration group that enables it. Channel keys are the stable
//! snake_case names used in statistic identifiers.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Polling cadence of a channel.
///
/// Fast channels come from `realtime.csv`, slow channels from the day log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CadenceClass {
    /// Instantaneous telemetry (power, voltages, currents, status).
    Fast,
    /// Cumulative energy from the daily log.
    Slow,
}

impl CadenceClass {
    /// Both cadence classes, fast first.
    pub const ALL: [CadenceClass; 2] = [CadenceClass::Fast, CadenceClass::Slow];
}

impl fmt::Display for CadenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CadenceClass::Fast => write!(f, "fast"),
            CadenceClass::Slow => write!(f, "slow"),
        }
    }
}

/// Physical unit of a channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Unit {
    Watt,
    KilowattHour,
    Volt,
    Ampere,
    Celsius,
    /// Enumerated values have no unit.
    None,
}

impl Unit {
    /// Display symbol, e.g. `"kWh"`.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Watt => "W",
            Unit::KilowattHour => "kWh",
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Celsius => "°C",
            Unit::None => "",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Whether a channel carries a number or an enumerated status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ValueKind {
    Numeric,
    Enumerated,
}

/// How long-term statistics interpret a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StateClass {
    /// A sampled quantity such as power or voltage.
    Measurement,
    /// A counter that only grows within a segment.
    TotalIncreasing,
}

/// Optional channel groups an operator can enable per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChannelGroup {
    GeneratorVoltage,
    GeneratorCurrent,
    GridVoltage,
    GridCurrent,
}

/// A named measurable quantity reported by the inverter.
///
/// # Examples
///
/// ```
/// use kaco_types::{CadenceClass, Channel, Unit};
///
/// assert_eq!(Channel::Power.key(), "power");
/// assert_eq!(Channel::EnergyToday.unit(), Unit::KilowattHour);
/// assert_eq!(Channel::EnergyToday.cadence(), CadenceClass::Slow);
/// assert_eq!("generator_voltage1".parse::<Channel>().unwrap(), Channel::GeneratorVoltage1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Channel {
    /// AC output power.
    Power,
    /// Energy produced since midnight (device local time).
    EnergyToday,
    GeneratorVoltage1,
    GeneratorVoltage2,
    GeneratorCurrent1,
    GeneratorCurrent2,
    GridVoltage1,
    GridVoltage2,
    GridVoltage3,
    GridCurrent1,
    GridCurrent2,
    GridCurrent3,
    /// Heat sink temperature.
    Temperature,
    /// Operating status code, see [`InverterStatus`](crate::InverterStatus).
    Status,
}

impl Channel {
    /// Every channel, in display order.
    pub const ALL: [Channel; 14] = [
        Channel::Power,
        Channel::EnergyToday,
        Channel::GeneratorVoltage1,
        Channel::GeneratorVoltage2,
        Channel::GeneratorCurrent1,
        Channel::GeneratorCurrent2,
        Channel::GridVoltage1,
        Channel::GridVoltage2,
        Channel::GridVoltage3,
        Channel::GridCurrent1,
        Channel::GridCurrent2,
        Channel::GridCurrent3,
        Channel::Temperature,
        Channel::Status,
    ];

    /// Stable snake_case key used in statistic identifiers.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Channel::Power => "power",
            Channel::EnergyToday => "energy_today",
            Channel::GeneratorVoltage1 => "generator_voltage1",
            Channel::GeneratorVoltage2 => "generator_voltage2",
            Channel::GeneratorCurrent1 => "generator_current1",
            Channel::GeneratorCurrent2 => "generator_current2",
            Channel::GridVoltage1 => "grid_voltage1",
            Channel::GridVoltage2 => "grid_voltage2",
            Channel::GridVoltage3 => "grid_voltage3",
            Channel::GridCurrent1 => "grid_current1",
            Channel::GridCurrent2 => "grid_current2",
            Channel::GridCurrent3 => "grid_current3",
            Channel::Temperature => "temperature",
            Channel::Status => "status",
        }
    }

    /// The camelCase value key of the older identifier scheme.
    #[must_use]
    pub fn camel_key(&self) -> &'static str {
        match self {
            Channel::Power => "currentPower",
            Channel::EnergyToday => "energyToday",
            Channel::GeneratorVoltage1 => "generatorVoltage1",
            Channel::GeneratorVoltage2 => "generatorVoltage2",
            Channel::GeneratorCurrent1 => "generatorCurrent1",
            Channel::GeneratorCurrent2 => "generatorCurrent2",
            Channel::GridVoltage1 => "gridVoltage1",
            Channel::GridVoltage2 => "gridVoltage2",
            Channel::GridVoltage3 => "gridVoltage3",
            Channel::GridCurrent1 => "gridCurrent1",
            Channel::GridCurrent2 => "gridCurrent2",
            Channel::GridCurrent3 => "gridCurrent3",
            Channel::Temperature => "temperature",
            Channel::Status => "status",
        }
    }

    /// Every spelling this channel has had in statistic identifiers.
    ///
    /// Includes the current key, the snake_case form of the camelCase key,
    /// and the lowercased camelCase key. Longest first.
    #[must_use]
    pub fn identifier_keys(&self) -> Vec<String> {
        let mut keys = vec![
            self.key().to_string(),
            camel_to_snake(self.camel_key()),
            self.camel_key().to_lowercase(),
        ];
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        keys.dedup();
        keys
    }

    /// Physical unit of the channel.
    #[must_use]
    pub fn unit(&self) -> Unit {
        match self {
            Channel::Power => Unit::Watt,
            Channel::EnergyToday => Unit::KilowattHour,
            Channel::GeneratorVoltage1
            | Channel::GeneratorVoltage2
            | Channel::GridVoltage1
            | Channel::GridVoltage2
            | Channel::GridVoltage3 => Unit::Volt,
            Channel::GeneratorCurrent1
            | Channel::GeneratorCurrent2
            | Channel::GridCurrent1
            | Channel::GridCurrent2
            | Channel::GridCurrent3 => Unit::Ampere,
            Channel::Temperature => Unit::Celsius,
            Channel::Status => Unit::None,
        }
    }

    #[must_use]
    pub fn value_kind(&self) -> ValueKind {
        match self {
            Channel::Status => ValueKind::Enumerated,
            _ => ValueKind::Numeric,
        }
    }

    /// Cadence class the channel is refreshed by.
    #[must_use]
    pub fn cadence(&self) -> CadenceClass {
        match self {
            Channel::EnergyToday => CadenceClass::Slow,
            _ => CadenceClass::Fast,
        }
    }

    #[must_use]
    pub fn state_class(&self) -> StateClass {
        match self {
            Channel::EnergyToday => StateClass::TotalIncreasing,
            _ => StateClass::Measurement,
        }
    }

    /// The optional group enabling this channel, or `None` if always exposed.
    #[must_use]
    pub fn group(&self) -> Option<ChannelGroup> {
        match self {
            Channel::GeneratorVoltage1 | Channel::GeneratorVoltage2 => {
                Some(ChannelGroup::GeneratorVoltage)
            }
            Channel::GeneratorCurrent1 | Channel::GeneratorCurrent2 => {
                Some(ChannelGroup::GeneratorCurrent)
            }
            Channel::GridVoltage1 | Channel::GridVoltage2 | Channel::GridVoltage3 => {
                Some(ChannelGroup::GridVoltage)
            }
            Channel::GridCurrent1 | Channel::GridCurrent2 | Channel::GridCurrent3 => {
                Some(ChannelGroup::GridCurrent)
            }
            Channel::Power | Channel::EnergyToday | Channel::Temperature | Channel::Status => None,
        }
    }

    /// Whether long-term statistics are kept for this channel.
    #[must_use]
    pub fn has_statistics(&self) -> bool {
        self.value_kind() == ValueKind::Numeric
    }

    /// Channels exposed when the given groups are enabled.
    pub fn enabled(groups: &[ChannelGroup]) -> impl Iterator<Item = Channel> + '_ {
        Self::ALL
            .into_iter()
            .filter(move |c| c.group().is_none_or(|g| groups.contains(&g)))
    }

    /// Look up a channel by any of its identifier spellings.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Channel> {
        Self::ALL.into_iter().find(|c| {
            c.key() == key
                || c.camel_key() == key
                || c.identifier_keys().iter().any(|k| k == key)
        })
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl core::str::FromStr for Channel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::from_key(s).ok_or_else(|| ParseError::UnknownChannel(s.to_string()))
    }
}

/// Convert a camelCase key to snake_case.
///
/// Digits are not separated from the preceding word.
///
/// ```
/// use kaco_types::camel_to_snake;
///
/// assert_eq!(camel_to_snake("generatorVoltage1"), "generator_voltage1");
/// assert_eq!(camel_to_snake("currentPower"), "current_power");
/// assert_eq!(camel_to_snake("power"), "power");
/// ```
#[must_use]
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
