//! ITR 90 frame codec.
//!
//! The gauge streams a 9-byte frame roughly every 20 ms:
//!
//! | byte | meaning                     |
//! |------|-----------------------------|
//! | 0    | length marker, always 7     |
//! | 1    | page marker, always 5       |
//! | 2    | status                      |
//! | 3    | error                       |
//! | 4    | measurement high byte       |
//! | 5    | measurement low byte        |
//! | 6    | firmware version (x20)      |
//! | 7    | sensor type                 |
//! | 8    | checksum, low byte of sum(1..=7) |
//!
//! Everything here is pure: no I/O, no state.

use std::fmt;

use serde::Serialize;

// ============================================================================
// Constants
// ============================================================================

/// Size of one device frame in bytes.
pub const FRAME_LEN: usize = 9;

/// Size of one host-to-device command in bytes.
pub const COMMAND_LEN: usize = 5;

/// First byte of every frame.
pub const LENGTH_MARKER: u8 = 7;

/// Second byte of every frame.
pub const PAGE_MARKER: u8 = 5;

const MBAR_TO_TORR: f64 = 0.750062;
const MBAR_TO_PA: f64 = 100.0;

// ============================================================================
// Data Types
// ============================================================================

/// Emission state reported in bits 0-1 of the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Emission {
    Off,
    LowEmission,
    HighEmission,
    Degas,
}

impl Emission {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Emission::Off,
            1 => Emission::LowEmission,
            2 => Emission::HighEmission,
            _ => Emission::Degas,
        }
    }
}

impl fmt::Display for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Emission::Off => "off",
            Emission::LowEmission => "low emission",
            Emission::HighEmission => "high emission",
            Emission::Degas => "degas",
        };
        f.write_str(s)
    }
}

/// Pressure unit the gauge is configured to display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureUnit {
    #[default]
    Mbar,
    Torr,
    Pa,
}

impl PressureUnit {
    /// Map the 2-bit unit code from the status byte. Unknown codes are mbar.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PressureUnit::Torr,
            2 => PressureUnit::Pa,
            _ => PressureUnit::Mbar,
        }
    }

    /// Parse a unit name case-insensitively, falling back to mbar.
    pub fn from_name_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "torr" => PressureUnit::Torr,
            "pa" => PressureUnit::Pa,
            _ => PressureUnit::Mbar,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressureUnit::Mbar => "mbar",
            PressureUnit::Torr => "Torr",
            PressureUnit::Pa => "Pa",
        }
    }

    fn factor(self) -> f64 {
        match self {
            PressureUnit::Mbar => 1.0,
            PressureUnit::Torr => MBAR_TO_TORR,
            PressureUnit::Pa => MBAR_TO_PA,
        }
    }
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub emission: Emission,
    pub unit: PressureUnit,
    /// Raw 2-bit unit code. Code 3 is undefined and decodes as mbar.
    pub unit_code: u8,
    pub toggle: bool,
    /// 1000 mbar adjustment is active.
    pub adjust_1000_mbar: bool,
}

/// Decoded error byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorFlags {
    pub pirani_adjust: bool,
    pub ba_error: bool,
    pub pirani_error: bool,
    pub has_error: bool,
    pub code: u8,
}

/// One accepted frame, decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Pressure in `status.unit`.
    pub pressure: f64,
    pub pressure_mbar: f64,
    pub status: Status,
    pub error: ErrorFlags,
    pub firmware_version: f64,
    pub sensor_type: u8,
    pub raw: [u8; FRAME_LEN],
}

impl Reading {
    pub fn unit(&self) -> PressureUnit {
        self.status.unit
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3e} {} ({})",
            self.pressure, self.status.unit, self.status.emission
        )?;
        if self.error.has_error {
            write!(f, " error={:#04x}", self.error.code)?;
        }
        Ok(())
    }
}

// ============================================================================
// Decoding
// ============================================================================

pub fn decode_status(byte: u8) -> Status {
    let unit_code = (byte >> 2) & 0b11;
    Status {
        emission: Emission::from_bits(byte),
        unit: PressureUnit::from_code(unit_code),
        unit_code,
        toggle: byte & 0x10 != 0,
        adjust_1000_mbar: byte & 0x20 != 0,
    }
}

pub fn decode_error(byte: u8) -> ErrorFlags {
    let pirani_adjust = byte & 0x01 != 0;
    let ba_error = byte & 0x02 != 0;
    let pirani_error = byte & 0x04 != 0;
    ErrorFlags {
        pirani_adjust,
        ba_error,
        pirani_error,
        has_error: pirani_adjust || ba_error || pirani_error,
        code: byte,
    }
}

/// Pressure in mbar from the two measurement bytes:
/// `p = 10 ^ ((high * 256 + low) / 4000 - 12.5)`.
pub fn calc_pressure_mbar(high: u8, low: u8) -> f64 {
    let raw = (u16::from(high) << 8) | u16::from(low);
    10f64.powf(f64::from(raw) / 4000.0 - 12.5)
}

/// Convert a value in mbar into `unit`.
pub fn convert(mbar: f64, unit: PressureUnit) -> f64 {
    mbar * unit.factor()
}

/// Convert a value expressed in `unit` back into mbar.
pub fn to_mbar(value: f64, unit: PressureUnit) -> f64 {
    value / unit.factor()
}

/// Low byte of the sum of bytes 1..=7 must equal byte 8.
pub fn validate_checksum(frame: &[u8]) -> bool {
    if frame.len() < FRAME_LEN {
        return false;
    }
    checksum(&frame[1..8]) == frame[8]
}

/// Checksum over the given bytes (the caller passes bytes 1..=7).
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Decode a 9-byte frame. Returns `None` for anything that is not a valid frame.
pub fn decode_frame(frame: &[u8]) -> Option<Reading> {
    let raw: [u8; FRAME_LEN] = frame.try_into().ok()?;
    if raw[0] != LENGTH_MARKER || raw[1] != PAGE_MARKER || !validate_checksum(&raw) {
        return None;
    }

    let status = decode_status(raw[2]);
    let pressure_mbar = calc_pressure_mbar(raw[4], raw[5]);

    Some(Reading {
        pressure: convert(pressure_mbar, status.unit),
        pressure_mbar,
        status,
        error: decode_error(raw[3]),
        firmware_version: f64::from(raw[6]) / 20.0,
        sensor_type: raw[7],
        raw,
    })
}

// ============================================================================
// Commands
// ============================================================================

/// A fixed host-to-device command.
///
/// The gauge does not acknowledge commands; they are written once and forgotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    bytes: [u8; COMMAND_LEN],
}

impl Command {
    pub const SET_MBAR: Command = Command::new("set_mbar", [3, 16, 62, 0, 78]);
    pub const SET_TORR: Command = Command::new("set_torr", [3, 16, 62, 1, 79]);
    pub const SET_PA: Command = Command::new("set_pa", [3, 16, 62, 2, 80]);
    pub const SAVE_UNIT: Command = Command::new("save_unit", [3, 32, 62, 62, 156]);
    pub const DEGAS_ON: Command = Command::new("degas_on", [3, 16, 93, 148, 1]);
    pub const DEGAS_OFF: Command = Command::new("degas_off", [3, 16, 93, 105, 214]);

    pub const ALL: [Command; 6] = [
        Command::SET_MBAR,
        Command::SET_TORR,
        Command::SET_PA,
        Command::SAVE_UNIT,
        Command::DEGAS_ON,
        Command::DEGAS_OFF,
    ];

    const fn new(name: &'static str, bytes: [u8; COMMAND_LEN]) -> Self {
        Self { name, bytes }
    }

    /// Look a command up by name (`set_torr`, `SET-TORR` and `set torr` all match).
    pub fn by_name(name: &str) -> Option<Command> {
        let wanted = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Command::ALL.into_iter().find(|c| c.name == wanted)
    }

    /// Command that selects `unit` on the gauge.
    pub fn set_unit(unit: PressureUnit) -> Command {
        match unit {
            PressureUnit::Mbar => Command::SET_MBAR,
            PressureUnit::Torr => Command::SET_TORR,
            PressureUnit::Pa => Command::SET_PA,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for Command {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.bytes)
    }
}

/// Build a valid frame from its payload bytes (status through sensor type).
///
/// Used by tests and by anything that needs to synthesize gauge output.
pub fn encode_frame(
    status: u8,
    error: u8,
    high: u8,
    low: u8,
    firmware: u8,
    sensor: u8,
) -> [u8; FRAME_LEN] {
    let mut frame = [
        LENGTH_MARKER,
        PAGE_MARKER,
        status,
        error,
        high,
        low,
        firmware,
        sensor,
        0,
    ];
    frame[8] = checksum(&frame[1..8]);
    frame
}
