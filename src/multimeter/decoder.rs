//! Measurement decoding.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::frame::RawFrame;

// What the instrument is measuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementMode {
    Voltage,
    Current,
    Resistance,
    Unimplemented,
}

impl MeasurementMode {
    pub fn unit(&self) -> &'static str {
        match self {
            MeasurementMode::Voltage => "V",
            MeasurementMode::Current => "mA",
            MeasurementMode::Resistance => "Ω",
            MeasurementMode::Unimplemented => "",
        }
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasurementMode::Voltage => "Voltage",
            MeasurementMode::Current => "Current",
            MeasurementMode::Resistance => "Resistance",
            MeasurementMode::Unimplemented => "Unimplemented",
        };
        f.write_str(name)
    }
}

/// A decoded reading. `value` is 0 when `overflow` is set or the mode is unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedMeasurement {
    pub value: f64,
    pub mode: MeasurementMode,
    pub overflow: bool,
}

/// How the range nibble of a current frame places the decimal point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentPlacement {
    /// The point follows `range` digits, as for voltage.
    Range,
    /// Auto-ranging in thousands, as for resistance.
    #[default]
    AutoRange,
}

/// Mode codes reported by the instrument in the second nibble after the digits.
///
/// Current decoding differs between meter revisions; set `current` to `None`
/// (`current = false` in configuration files) to report current frames as
/// `Unimplemented`, or pick the decimal rule with `current_placement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeTable {
    pub voltage: u8,
    #[serde(with = "optional_code")]
    pub millivolt: Option<u8>,
    #[serde(with = "optional_code")]
    pub current: Option<u8>,
    pub current_placement: CurrentPlacement,
    pub resistance: u8,
}

impl ModeTable {
    /// Every code in use, in table order.
    pub fn codes(&self) -> Vec<(&'static str, u8)> {
        let mut codes = vec![("voltage", self.voltage)];
        codes.extend(self.millivolt.map(|code| ("millivolt", code)));
        codes.extend(self.current.map(|code| ("current", code)));
        codes.push(("resistance", self.resistance));
        codes
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self {
            voltage: 1,
            millivolt: Some(3),
            current: Some(8),
            current_placement: CurrentPlacement::AutoRange,
            resistance: 4,
        }
    }
}

// A mode code, or `false` when the mode is not decoded.
mod optional_code {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Code(u8),
        Switch(bool),
    }

    pub fn serialize<S: Serializer>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(code) => Repr::Code(*code),
            None => Repr::Switch(false),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Code(code) => Ok(Some(code)),
            Repr::Switch(false) => Ok(None),
            Repr::Switch(true) => Err(D::Error::custom("expected a mode code or false")),
        }
    }
}

// Where the decimal point goes and how the result is scaled.
struct Placement {
    mode: MeasurementMode,
    decimal: u32,
    mul: f64,
    div: f64,
}

impl Placement {
    // Point after `range` digits.
    fn fixed(mode: MeasurementMode, range: u32) -> Self {
        Placement { mode, decimal: range, mul: 1.0, div: 1.0 }
    }

    // Ranges step through units, sub-units and thousands of units.
    fn auto_range(mode: MeasurementMode, range: u32) -> Self {
        Placement {
            mode,
            decimal: (range + 1) % 3 + 1,
            mul: 1000f64.powi(((range + 1) / 3) as i32),
            div: 1.0,
        }
    }
}

const DIGITS: u32 = 5;
const SIGN_BIT: u8 = 0b100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeasurementDecoder {
    modes: ModeTable,
}

impl MeasurementDecoder {
    pub fn new(modes: ModeTable) -> Self {
        Self { modes }
    }

    pub fn modes(&self) -> &ModeTable {
        &self.modes
    }

    fn placement(&self, range: u8, mode: u8) -> Placement {
        let range = u32::from(range);
        let modes = &self.modes;
        if mode == modes.voltage {
            Placement::fixed(MeasurementMode::Voltage, range)
        } else if Some(mode) == modes.millivolt {
            Placement { mode: MeasurementMode::Voltage, decimal: 3, mul: 1.0, div: 1000.0 }
        } else if Some(mode) == modes.current {
            match modes.current_placement {
                CurrentPlacement::Range => Placement::fixed(MeasurementMode::Current, range),
                CurrentPlacement::AutoRange => Placement::auto_range(MeasurementMode::Current, range),
            }
        } else if mode == modes.resistance {
            // Ω, kΩ and MΩ.
            Placement::auto_range(MeasurementMode::Resistance, range)
        } else {
            Placement { mode: MeasurementMode::Unimplemented, decimal: 0, mul: 1.0, div: 1.0 }
        }
    }

    /// Decodes one frame into a signed value, its mode and the overflow flag.
    pub fn decode(&self, frame: &RawFrame) -> DecodedMeasurement {
        let digits = frame.digits();
        let rest = frame.rest();

        let overflow = digits.iter().any(|&d| d > 9);
        let placement = self.placement(rest[0], rest[1]);

        let mut value = if overflow || placement.mode == MeasurementMode::Unimplemented {
            0.0
        } else {
            let whole = digits.iter().fold(0u32, |acc, &d| acc * 10 + u32::from(d));
            // A point placed after every digit leaves an integer.
            let fraction_digits = DIGITS - placement.decimal.min(DIGITS);
            f64::from(whole) / 10f64.powi(fraction_digits as i32)
        };

        if rest[3] & SIGN_BIT != 0 {
            value = -value;
        }
        value = value * placement.mul / placement.div;

        DecodedMeasurement {
            value,
            mode: placement.mode,
            overflow,
        }
    }
}
