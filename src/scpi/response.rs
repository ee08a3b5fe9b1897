//! Parsers for SCPI replies.

use crate::error::{InstrumentError, SmuError, SmuResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value the instrument returns in place of a reading it could not take
/// (SCPI "not a number", e.g. measurement overflow).
pub const SCPI_NAN: f64 = 9.91e37;

/// Parse a single numeric reply (NR1, NR2 or NR3 format).
pub fn parse_f64(context: &str, reply: &str) -> SmuResult<f64> {
    let trimmed = reply.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| SmuError::parse(context, trimmed))
}

/// Parse a comma separated list of numbers, as returned by `:FETC:ARR`.
pub fn parse_f64_list(context: &str, reply: &str) -> SmuResult<Vec<f64>> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|_| SmuError::parse(context, trimmed))
        })
        .collect()
}

/// Parse a boolean reply (`1`/`0`, `ON`/`OFF`).
pub fn parse_bool(context: &str, reply: &str) -> SmuResult<bool> {
    let trimmed = reply.trim();
    match trimmed.to_uppercase().as_str() {
        "1" | "ON" | "TRUE" => Ok(true),
        "0" | "OFF" | "FALSE" => Ok(false),
        _ => Err(SmuError::parse(context, trimmed)),
    }
}

/// Parse one `:SYST:ERR?` entry, e.g. `+0,"No error"`.
pub fn parse_error_entry(reply: &str) -> SmuResult<InstrumentError> {
    let trimmed = reply.trim();
    let (code, message) = trimmed
        .split_once(',')
        .ok_or_else(|| SmuError::parse(":SYST:ERR?", trimmed))?;
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| SmuError::parse(":SYST:ERR?", trimmed))?;
    Ok(InstrumentError {
        code,
        message: message.trim().trim_matches('"').to_string(),
    })
}

/// Whether a reading is the SCPI "not a number" placeholder.
pub fn is_overflow(value: f64) -> bool {
    (value - SCPI_NAN).abs() < 1e31
}

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    pub fn parse(reply: &str) -> SmuResult<Self> {
        let trimmed = reply.trim();
        let fields: Vec<&str> = trimmed.splitn(4, ',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial, firmware] if !model.is_empty() => Ok(Self {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                serial: serial.to_string(),
                firmware: firmware.to_string(),
            }),
            _ => Err(SmuError::parse("*IDN?", trimmed)),
        }
    }

    /// Case-insensitive substring match on the model field. An empty pattern
    /// matches nothing.
    pub fn matches_model(&self, expected: &str) -> bool {
        let expected = expected.trim();
        !expected.is_empty() && self.model.to_uppercase().contains(&expected.to_uppercase())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}
