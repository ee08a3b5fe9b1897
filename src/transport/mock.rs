//! Simulated B2902B for testing without hardware.
//!
//! The mock understands the subset of the B2900 command set this crate emits,
//! keeps per-channel source/sense state, and models a resistive load on each
//! output so that spot measurements and sweeps produce plausible numbers
//! (including compliance clamping). It provides:
//! - a call log of every line received, for test verification
//! - failure injection on the next call
//! - an instrument error queue served by `:SYST:ERR?`
//!
//! Unknown commands push `-113,"Undefined header"` onto the error queue, the way
//! the instrument does; unknown queries produce no reply and therefore time out.
//!
//! ```
//! use keysight_smu::transport::{MockTransport, ScpiTransport};
//!
//! # tokio_test::block_on(async {
//! let mock = MockTransport::new();
//! mock.write(":SOUR1:VOLT 1.5").await.unwrap();
//! assert_eq!(mock.call_log(), vec![":SOUR1:VOLT 1.5".to_string()]);
//! # })
//! ```

use super::ScpiTransport;
use crate::error::{InstrumentError, SmuError, SmuResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default `*IDN?` reply of the mock.
pub const MOCK_IDENTITY: &str = "Keysight Technologies,B2902B,MOCK000001,5.0.2040.0000";

/// Default load resistance on each output, in ohms.
pub const DEFAULT_LOAD_OHMS: f64 = 1_000.0;

const MAX_VOLTAGE: f64 = 210.0;
const MAX_CURRENT: f64 = 3.03;

#[derive(Debug, Clone)]
struct ChannelSim {
    mode: Mode,
    voltage_level: f64,
    current_level: f64,
    voltage_limit: f64,
    current_limit: f64,
    voltage_range: f64,
    current_range: f64,
    output_on: bool,
    voltage_nplc: f64,
    current_nplc: f64,
    four_wire: bool,
    sweeping: bool,
    sweep_start: f64,
    sweep_stop: f64,
    sweep_points: u32,
    trigger_timer: Option<f64>,
    trigger_count: u32,
    load_ohms: f64,
    time_buffer: Vec<f64>,
    voltage_buffer: Vec<f64>,
    current_buffer: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Voltage,
    Current,
}

impl Default for ChannelSim {
    fn default() -> Self {
        Self {
            mode: Mode::Voltage,
            voltage_level: 0.0,
            current_level: 0.0,
            voltage_limit: 2.0,
            current_limit: 1e-4,
            voltage_range: 20.0,
            current_range: 2.0,
            output_on: false,
            voltage_nplc: 1.0,
            current_nplc: 1.0,
            four_wire: false,
            sweeping: false,
            sweep_start: 0.0,
            sweep_stop: 0.0,
            sweep_points: 1,
            trigger_timer: None,
            trigger_count: 1,
            load_ohms: DEFAULT_LOAD_OHMS,
            time_buffer: Vec::new(),
            voltage_buffer: Vec::new(),
            current_buffer: Vec::new(),
        }
    }
}

impl ChannelSim {
    /// Voltage and current across the load for the given source value.
    fn operating_point(&self, source: f64) -> (f64, f64) {
        let r = self.load_ohms;
        match self.mode {
            Mode::Voltage => {
                let i = source / r;
                if i.abs() > self.current_limit {
                    let i = self.current_limit.copysign(i);
                    (i * r, i)
                } else {
                    (source, i)
                }
            }
            Mode::Current => {
                let v = source * r;
                if v.abs() > self.voltage_limit {
                    let v = self.voltage_limit.copysign(v);
                    (v, v / r)
                } else {
                    (v, source)
                }
            }
        }
    }

    fn level(&self) -> f64 {
        match self.mode {
            Mode::Voltage => self.voltage_level,
            Mode::Current => self.current_level,
        }
    }

    fn run_trigger(&mut self) {
        let count = self.trigger_count.max(1);
        let step_time = self
            .trigger_timer
            .unwrap_or(self.voltage_nplc.max(self.current_nplc) / 50.0);
        self.time_buffer.clear();
        self.voltage_buffer.clear();
        self.current_buffer.clear();
        for i in 0..count {
            let source = if self.sweeping && self.sweep_points > 1 {
                let idx = i.min(self.sweep_points - 1) as f64;
                self.sweep_start
                    + (self.sweep_stop - self.sweep_start) * idx / (self.sweep_points - 1) as f64
            } else if self.sweeping {
                self.sweep_start
            } else {
                self.level()
            };
            let (v, c) = self.operating_point(source);
            self.time_buffer.push(i as f64 * step_time);
            self.voltage_buffer.push(v);
            self.current_buffer.push(c);
        }
        self.output_on = true;
    }
}

#[derive(Debug)]
struct MockState {
    identity: String,
    channels: [ChannelSim; 2],
    errors: VecDeque<InstrumentError>,
    call_log: Vec<String>,
    display_enabled: bool,
}

impl MockState {
    fn new() -> Self {
        Self {
            identity: MOCK_IDENTITY.to_string(),
            channels: [ChannelSim::default(), ChannelSim::default()],
            errors: VecDeque::new(),
            call_log: Vec::new(),
            display_enabled: true,
        }
    }

    fn push_error(&mut self, code: i32, message: &str) {
        self.errors.push_back(InstrumentError {
            code,
            message: message.to_string(),
        });
    }

    fn reset(&mut self) {
        let loads = [self.channels[0].load_ohms, self.channels[1].load_ohms];
        self.channels = [ChannelSim::default(), ChannelSim::default()];
        self.channels[0].load_ohms = loads[0];
        self.channels[1].load_ohms = loads[1];
        self.display_enabled = true;
    }
}

/// Split `SOUR2` into (`SOUR`, Some(2)). A trailing `?` is ignored.
fn split_suffix(segment: &str) -> (&str, Option<usize>) {
    let segment = segment.trim_end_matches('?');
    let digits = segment
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit())
        .map(|(i, _)| i);
    match digits {
        Some(i) => (&segment[..i], segment[i..].parse().ok()),
        None => (segment, None),
    }
}

/// Parse a channel list such as `(@1)`.
fn parse_channel_list(arg: &str) -> Option<usize> {
    arg.trim()
        .strip_prefix("(@")?
        .strip_suffix(')')?
        .trim()
        .parse()
        .ok()
}

fn format_reading(value: f64) -> String {
    format!("{value:+.6E}")
}

fn format_list(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format_reading(*v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Outcome of one line processed by the simulator.
enum Outcome {
    Done,
    Reply(String),
    /// The instrument does not answer; the caller times out.
    Silent,
}

/// In-memory simulation of a Keysight B2902B.
///
/// Cloning shares the simulated instrument, so a test can keep a handle for
/// inspection while a session owns the boxed transport.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    resource_name: String,
    timeout: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
            connected: Arc::new(AtomicBool::new(true)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            resource_name: "MOCK0::B2902B::INSTR".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Override the `*IDN?` reply, e.g. to simulate a different model.
    pub fn with_identity(self, identity: &str) -> Self {
        self.lock().identity = identity.to_string();
        self
    }

    pub fn with_resource_name(mut self, resource: &str) -> Self {
        self.resource_name = resource.to_string();
        self
    }

    /// Resistance of the simulated load on `channel` (1 or 2).
    pub fn with_load(self, channel: usize, ohms: f64) -> Self {
        if let Some(ch) = self.lock().channels.get_mut(channel.wrapping_sub(1)) {
            ch.load_ohms = ohms;
        }
        self
    }

    /// Make the next write or query fail with a transport error.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Queue an entry on the instrument error queue.
    pub fn push_instrument_error(&self, code: i32, message: &str) {
        self.lock().push_error(code, message);
    }

    /// Every line received so far, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    pub fn clear_call_log(&self) {
        self.lock().call_log.clear();
    }

    /// Whether the simulated output of `channel` (1 or 2) is on.
    pub fn output_on(&self, channel: usize) -> bool {
        self.lock()
            .channels
            .get(channel.wrapping_sub(1))
            .is_some_and(|ch| ch.output_on)
    }

    /// Whether the simulated channel is in four-wire (remote sense) mode.
    pub fn four_wire(&self, channel: usize) -> bool {
        self.lock()
            .channels
            .get(channel.wrapping_sub(1))
            .is_some_and(|ch| ch.four_wire)
    }

    pub fn display_enabled(&self) -> bool {
        self.lock().display_enabled
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_ready(&self) -> SmuResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SmuError::NotConnected);
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(SmuError::Transport("Mock transport failure".into()));
        }
        Ok(())
    }

    fn process(&self, line: &str) -> Outcome {
        let mut state = self.lock();
        state.call_log.push(line.to_string());

        let upper = line.trim().to_uppercase();
        let upper = upper.trim_start_matches(':');
        let (header, arg) = match upper.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (upper, ""),
        };

        match header {
            "*IDN?" => return Outcome::Reply(state.identity.clone()),
            "*RST" => {
                state.reset();
                return Outcome::Done;
            }
            "*CLS" => {
                state.errors.clear();
                return Outcome::Done;
            }
            "*OPC?" => return Outcome::Reply("1".into()),
            "SYST:ERR?" | "SYST:ERR:NEXT?" => {
                let entry = state.errors.pop_front().unwrap_or(InstrumentError {
                    code: 0,
                    message: "No error".into(),
                });
                return Outcome::Reply(format!("{:+},\"{}\"", entry.code, entry.message));
            }
            _ => {}
        }

        let mut segments = header.split(':');
        let (root, suffix) = split_suffix(segments.next().unwrap_or_default());
        let rest: Vec<&str> = segments.collect();
        let rest = rest.join(":");
        let is_query = header.ends_with('?');

        let channel = match root {
            "MEAS" | "FETC" | "INIT" => parse_channel_list(arg),
            "DISP" => Some(1),
            _ => Some(suffix.unwrap_or(1)),
        };
        let Some(index) = channel.filter(|c| (1..=2).contains(c)).map(|c| c - 1) else {
            state.push_error(-114, "Header suffix out of range");
            return if is_query { Outcome::Silent } else { Outcome::Done };
        };

        let number = arg.parse::<f64>().ok();
        let on_off = match arg {
            "ON" | "1" => Some(true),
            "OFF" | "0" => Some(false),
            _ => None,
        };

        if root == "DISP" {
            let accepted = match (rest.as_str(), on_off) {
                ("ENAB", Some(enabled)) => {
                    state.display_enabled = enabled;
                    true
                }
                ("VIEW", _) => matches!(arg, "SING1" | "SING2" | "DUAL" | "GRAP"),
                _ => false,
            };
            if !accepted {
                state.push_error(-104, "Data type error");
            }
            return Outcome::Done;
        }

        let ch = &mut state.channels[index];
        let mut error: Option<(i32, &str)> = None;
        let bad_data = || Some((-104, "Data type error"));

        let outcome = match (root, rest.as_str()) {
            ("SOUR", "FUNC:MODE") => {
                match arg {
                    "VOLT" | "VOLTAGE" => ch.mode = Mode::Voltage,
                    "CURR" | "CURRENT" => ch.mode = Mode::Current,
                    _ => error = bad_data(),
                }
                Outcome::Done
            }
            ("SOUR", "VOLT") | ("SOUR", "CURR") => {
                match number {
                    Some(v) if rest == "VOLT" && v.abs() > MAX_VOLTAGE => {
                        error = Some((-222, "Data out of range"))
                    }
                    Some(v) if rest == "CURR" && v.abs() > MAX_CURRENT => {
                        error = Some((-222, "Data out of range"))
                    }
                    Some(v) if rest == "VOLT" => ch.voltage_level = v,
                    Some(v) => ch.current_level = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SOUR", "VOLT:RANG") | ("SOUR", "CURR:RANG") => {
                match number {
                    Some(v) if rest.starts_with("VOLT") => ch.voltage_range = v,
                    Some(v) => ch.current_range = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SOUR", "VOLT:MODE") | ("SOUR", "CURR:MODE") => {
                match arg {
                    "FIX" | "FIXED" => ch.sweeping = false,
                    "SWE" | "SWEEP" => ch.sweeping = true,
                    _ => error = bad_data(),
                }
                Outcome::Done
            }
            ("SOUR", "VOLT:STAR") | ("SOUR", "CURR:STAR") => {
                match number {
                    Some(v) => ch.sweep_start = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SOUR", "VOLT:STOP") | ("SOUR", "CURR:STOP") => {
                match number {
                    Some(v) => ch.sweep_stop = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SOUR", "VOLT:POIN") | ("SOUR", "CURR:POIN") => {
                match arg.parse::<u32>() {
                    Ok(n) if n >= 1 => ch.sweep_points = n,
                    _ => error = bad_data(),
                }
                Outcome::Done
            }
            ("SENS", "VOLT:PROT") => {
                match number {
                    Some(v) => ch.voltage_limit = v.abs(),
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SENS", "CURR:PROT") => {
                match number {
                    Some(v) => ch.current_limit = v.abs(),
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SENS", "VOLT:NPLC") => {
                match number {
                    Some(v) => ch.voltage_nplc = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SENS", "CURR:NPLC") => {
                match number {
                    Some(v) => ch.current_nplc = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SENS", "REM") => {
                match on_off {
                    Some(v) => ch.four_wire = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("SENS", "FUNC:ON") | ("SENS", "FUNC") => Outcome::Done,
            ("OUTP", "") if is_query => {
                Outcome::Reply(if ch.output_on { "1" } else { "0" }.into())
            }
            ("OUTP", "") => {
                match on_off {
                    Some(v) => ch.output_on = v,
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("TRIG", "SOUR") | ("TRIG", "ALL:SOUR") => {
                match arg {
                    "TIM" | "TIMER" => {}
                    "AINT" | "BUS" => ch.trigger_timer = None,
                    _ => error = bad_data(),
                }
                Outcome::Done
            }
            ("TRIG", "TIM") | ("TRIG", "ALL:TIM") => {
                match number {
                    Some(v) => ch.trigger_timer = Some(v),
                    None => error = bad_data(),
                }
                Outcome::Done
            }
            ("TRIG", "COUN") | ("TRIG", "ALL:COUN") => {
                match arg.parse::<u32>() {
                    Ok(n) if n >= 1 => ch.trigger_count = n,
                    _ => error = bad_data(),
                }
                Outcome::Done
            }
            ("INIT", "") => {
                ch.run_trigger();
                Outcome::Done
            }
            ("FETC", "ARR:TIME?") => Outcome::Reply(format_list(&ch.time_buffer)),
            ("FETC", "ARR:VOLT?") => Outcome::Reply(format_list(&ch.voltage_buffer)),
            ("FETC", "ARR:CURR?") => Outcome::Reply(format_list(&ch.current_buffer)),
            ("MEAS", "VOLT?") | ("MEAS", "CURR?") | ("MEAS", "RES?") => {
                // Spot measurements switch the output on automatically
                ch.output_on = true;
                let (v, i) = ch.operating_point(ch.level());
                let reading = match rest.as_str() {
                    "VOLT?" => v,
                    "CURR?" => i,
                    _ if i == 0.0 => crate::scpi::response::SCPI_NAN,
                    _ => v / i,
                };
                Outcome::Reply(format_reading(reading))
            }
            _ => {
                error = Some((-113, "Undefined header"));
                if is_query {
                    Outcome::Silent
                } else {
                    Outcome::Done
                }
            }
        };

        if let Some((code, message)) = error {
            state.push_error(code, message);
        }
        outcome
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&self, command: &str) -> SmuResult<()> {
        self.check_ready()?;
        tracing::debug!("Mock SCPI write: {}", command);
        self.process(command);
        Ok(())
    }

    async fn query_with_timeout(&self, command: &str, timeout: Duration) -> SmuResult<String> {
        self.check_ready()?;
        tracing::debug!("Mock SCPI query: {}", command);
        match self.process(command) {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Done | Outcome::Silent => Err(SmuError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        }
    }

    async fn close(&self) -> SmuResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
