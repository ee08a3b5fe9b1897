//! SCPI command builders for the B2900 series.
//!
//! Every function here is pure: it formats one command line (without the
//! terminator) and performs no I/O. The session layer in [`crate::smu`] writes
//! the resulting strings to the transport.

use crate::error::{SmuError, SmuResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Output channel of a B2900 SMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    /// Zero-based index, for per-channel state arrays.
    pub fn index(self) -> usize {
        match self {
            Channel::One => 0,
            Channel::Two => 1,
        }
    }

    /// SCPI channel suffix (`1` or `2`).
    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl TryFrom<u8> for Channel {
    type Error = SmuError;

    fn try_from(value: u8) -> SmuResult<Self> {
        match value {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            other => Err(SmuError::InvalidArgument(format!(
                "channel must be 1 or 2, got {other}"
            ))),
        }
    }
}

/// What the channel sources. The complementary quantity is the one measured
/// and limited (compliance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Voltage,
    Current,
}

impl SourceMode {
    /// SCPI mnemonic, `VOLT` or `CURR`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            SourceMode::Voltage => "VOLT",
            SourceMode::Current => "CURR",
        }
    }

    pub fn complement(self) -> SourceMode {
        match self {
            SourceMode::Voltage => SourceMode::Current,
            SourceMode::Current => SourceMode::Voltage,
        }
    }

    /// SI unit symbol, used in error messages.
    pub fn unit(self) -> &'static str {
        match self {
            SourceMode::Voltage => "V",
            SourceMode::Current => "A",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputState {
    On,
    Off,
}

impl OutputState {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OutputState::On => "ON",
            OutputState::Off => "OFF",
        }
    }
}

impl From<bool> for OutputState {
    fn from(value: bool) -> Self {
        if value {
            OutputState::On
        } else {
            OutputState::Off
        }
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Integration time of a measurement, in power-line cycles (NPLC).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeasurementSpeed {
    /// 0.01 PLC
    Fast,
    /// 0.1 PLC
    Medium,
    /// 1 PLC
    Normal,
    /// 10 PLC
    HighAccuracy,
    Custom(f64),
}

impl MeasurementSpeed {
    pub fn nplc(self) -> f64 {
        match self {
            MeasurementSpeed::Fast => 0.01,
            MeasurementSpeed::Medium => 0.1,
            MeasurementSpeed::Normal => 1.0,
            MeasurementSpeed::HighAccuracy => 10.0,
            MeasurementSpeed::Custom(nplc) => nplc,
        }
    }
}

/// Two-wire (local) or four-wire (remote, Kelvin) sensing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenseWire {
    TwoWire,
    FourWire,
}

/// Front panel view selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayView {
    Single1,
    Single2,
    Dual,
    Graph,
}

impl DisplayView {
    pub fn mnemonic(self) -> &'static str {
        match self {
            DisplayView::Single1 => "SING1",
            DisplayView::Single2 => "SING2",
            DisplayView::Dual => "DUAL",
            DisplayView::Graph => "GRAP",
        }
    }
}

/// Trigger source of the transient (source) and acquire (measure) layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Automatic internal trigger.
    AutoInternal,
    /// Internal timer, see [`trigger_timer`].
    Timer,
}

impl TriggerSource {
    pub fn mnemonic(self) -> &'static str {
        match self {
            TriggerSource::AutoInternal => "AINT",
            TriggerSource::Timer => "TIM",
        }
    }
}

/// Source sweep mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceShape {
    Fixed,
    Sweep,
}

impl SourceShape {
    pub fn mnemonic(self) -> &'static str {
        match self {
            SourceShape::Fixed => "FIX",
            SourceShape::Sweep => "SWE",
        }
    }
}

/// Format a number the way SCPI numeric parameters accept it.
///
/// Rust's `Display` for `f64` is the shortest string that round-trips, which
/// never uses exponent notation; values below 1e-4 are written in `E` form to
/// keep command lines short.
pub fn format_number(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e15).contains(&magnitude) {
        format!("{value:E}")
    } else {
        format!("{value}")
    }
}

/// `:SENS{ch}:{sense}:NPLC {nplc}`
pub fn measurement_speed(ch: Channel, sense: SourceMode, speed: MeasurementSpeed) -> String {
    format!(":SENS{ch}:{sense}:NPLC {}", format_number(speed.nplc()))
}

/// `:SOUR{ch}:FUNC:MODE {mode}`
pub fn source_mode(ch: Channel, mode: SourceMode) -> String {
    format!(":SOUR{ch}:FUNC:MODE {mode}")
}

/// `:SENS{ch}:REM {ON|OFF}`
pub fn sense_wire_mode(ch: Channel, wire: SenseWire) -> String {
    let state = OutputState::from(wire == SenseWire::FourWire);
    format!(":SENS{ch}:REM {state}")
}

/// `:SENS{ch}:{sense}:PROT {value}`, the compliance limit of the measured quantity.
pub fn limit(ch: Channel, sense: SourceMode, value: f64) -> String {
    format!(":SENS{ch}:{sense}:PROT {}", format_number(value))
}

/// `:SOUR{ch}:{mode} {value}`
pub fn level(ch: Channel, mode: SourceMode, value: f64) -> String {
    format!(":SOUR{ch}:{mode} {}", format_number(value))
}

/// `:SOUR{ch}:{mode}:RANG {value}`
pub fn source_range(ch: Channel, mode: SourceMode, value: f64) -> String {
    format!(":SOUR{ch}:{mode}:RANG {}", format_number(value))
}

/// `:OUTP{ch} {ON|OFF}`
pub fn output_state(ch: Channel, state: OutputState) -> String {
    format!(":OUTP{ch} {state}")
}

/// `:OUTP{ch}?`
pub fn output_state_query(ch: Channel) -> String {
    format!(":OUTP{ch}?")
}

/// `:MEAS:{mode}? (@{ch})`, a spot measurement.
pub fn measure(ch: Channel, mode: SourceMode) -> String {
    format!(":MEAS:{mode}? (@{ch})")
}

/// `:MEAS:RES? (@{ch})`
pub fn measure_resistance(ch: Channel) -> String {
    format!(":MEAS:RES? (@{ch})")
}

pub fn display_enable(enabled: bool) -> String {
    format!(":DISP:ENAB {}", OutputState::from(enabled))
}

pub fn display_view(view: DisplayView) -> String {
    format!(":DISP:VIEW {}", view.mnemonic())
}

/// `:SOUR{ch}:{mode}:MODE {FIX|SWE}`
pub fn source_shape(ch: Channel, mode: SourceMode, shape: SourceShape) -> String {
    format!(":SOUR{ch}:{mode}:MODE {}", shape.mnemonic())
}

/// Start, stop and point count of a staircase sweep.
pub fn sweep_range(ch: Channel, mode: SourceMode, start: f64, stop: f64, points: u32) -> [String; 3] {
    [
        format!(":SOUR{ch}:{mode}:STAR {}", format_number(start)),
        format!(":SOUR{ch}:{mode}:STOP {}", format_number(stop)),
        format!(":SOUR{ch}:{mode}:POIN {points}"),
    ]
}

/// `:SENS{ch}:FUNC:ON "VOLT","CURR"`, enables both measurement functions.
pub fn sense_functions_all(ch: Channel) -> String {
    format!(":SENS{ch}:FUNC:ON \"VOLT\",\"CURR\"")
}

/// `:TRIG{ch}:SOUR {source}`
pub fn trigger_source(ch: Channel, source: TriggerSource) -> String {
    format!(":TRIG{ch}:SOUR {}", source.mnemonic())
}

/// `:TRIG{ch}:TIM {seconds}`
pub fn trigger_timer(ch: Channel, interval: Duration) -> String {
    format!(":TRIG{ch}:TIM {}", format_number(interval.as_secs_f64()))
}

/// `:TRIG{ch}:COUN {count}`
pub fn trigger_count(ch: Channel, count: u32) -> String {
    format!(":TRIG{ch}:COUN {count}")
}

/// `:INIT (@{ch})`
pub fn initiate(ch: Channel) -> String {
    format!(":INIT (@{ch})")
}

/// `:FETC:ARR:{what}? (@{ch})`; `what` is `TIME`, `VOLT` or `CURR`.
pub fn fetch_array(ch: Channel, what: &str) -> String {
    format!(":FETC:ARR:{what}? (@{ch})")
}

pub const IDENTIFY: &str = "*IDN?";
pub const RESET: &str = "*RST";
pub const CLEAR_STATUS: &str = "*CLS";
pub const OPERATION_COMPLETE: &str = "*OPC?";
pub const NEXT_ERROR: &str = ":SYST:ERR?";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_applies_to_complement() {
        assert_eq!(SourceMode::Voltage.complement(), SourceMode::Current);
        assert_eq!(SourceMode::Current.complement(), SourceMode::Voltage);
        assert_eq!(
            limit(Channel::One, SourceMode::Voltage.complement(), 0.01),
            ":SENS1:CURR:PROT 0.01"
        );
    }

    #[test]
    fn test_channel_conversion() {
        assert_eq!(Channel::try_from(1).unwrap(), Channel::One);
        assert_eq!(Channel::try_from(2).unwrap(), Channel::Two);
        assert!(Channel::try_from(3).is_err());
        assert_eq!(Channel::Two.to_string(), "2");
    }

    #[test]
    fn test_source_and_level_commands() {
        assert_eq!(
            source_mode(Channel::One, SourceMode::Voltage),
            ":SOUR1:FUNC:MODE VOLT"
        );
        assert_eq!(level(Channel::Two, SourceMode::Current, 0.001), ":SOUR2:CURR 0.001");
        assert_eq!(level(Channel::One, SourceMode::Voltage, 5.0), ":SOUR1:VOLT 5");
        assert_eq!(
            source_range(Channel::One, SourceMode::Voltage, 20.0),
            ":SOUR1:VOLT:RANG 20"
        );
    }

    #[test]
    fn test_limit_and_sense_commands() {
        assert_eq!(limit(Channel::One, SourceMode::Current, 0.1), ":SENS1:CURR:PROT 0.1");
        assert_eq!(
            measurement_speed(Channel::Two, SourceMode::Voltage, MeasurementSpeed::Fast),
            ":SENS2:VOLT:NPLC 0.01"
        );
        assert_eq!(
            sense_wire_mode(Channel::One, SenseWire::FourWire),
            ":SENS1:REM ON"
        );
        assert_eq!(
            sense_wire_mode(Channel::One, SenseWire::TwoWire),
            ":SENS1:REM OFF"
        );
    }

    #[test]
    fn test_output_and_measure_commands() {
        assert_eq!(output_state(Channel::One, OutputState::On), ":OUTP1 ON");
        assert_eq!(output_state(Channel::Two, false.into()), ":OUTP2 OFF");
        assert_eq!(measure(Channel::One, SourceMode::Voltage), ":MEAS:VOLT? (@1)");
        assert_eq!(measure(Channel::Two, SourceMode::Current), ":MEAS:CURR? (@2)");
        assert_eq!(measure_resistance(Channel::One), ":MEAS:RES? (@1)");
    }

    #[test]
    fn test_small_numbers_use_exponent_form() {
        assert_eq!(format_number(1e-6), "1E-6");
        assert_eq!(format_number(-2.5e-9), "-2.5E-9");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(0.01), "0.01");
    }

    #[test]
    fn test_sweep_commands() {
        let [start, stop, points] = sweep_range(Channel::One, SourceMode::Voltage, 0.0, 1.5, 16);
        assert_eq!(start, ":SOUR1:VOLT:STAR 0");
        assert_eq!(stop, ":SOUR1:VOLT:STOP 1.5");
        assert_eq!(points, ":SOUR1:VOLT:POIN 16");
        assert_eq!(
            trigger_timer(Channel::Two, Duration::from_millis(10)),
            ":TRIG2:TIM 0.01"
        );
        assert_eq!(fetch_array(Channel::One, "CURR"), ":FETC:ARR:CURR? (@1)");
    }
}
