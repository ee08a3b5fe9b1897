//! Triggered acquisitions
//!
//! Two sweep shapes are supported:
//! - [`TimeSweep`]: hold a constant source value and sample on the internal
//!   timer, one point per `interval`.
//! - [`LinearSweep`]: a staircase from `start` to `stop` in `points` equal steps,
//!   one point per step.
//!
//! Both arm the trigger system with `:INIT`, wait on `*OPC?` and then fetch the
//! time stamp, voltage and current arrays.

use super::KeysightB2900;
use crate::error::{SmuError, SmuResult};
use crate::scpi::command::{self, Channel, OutputState, SourceMode, SourceShape, TriggerSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

/// Trigger count limit of the B2900 series.
pub const MAX_POINTS: u32 = 100_000;

/// Shortest trigger timer interval the B2900 accepts.
pub const MIN_INTERVAL: Duration = Duration::from_micros(20);

/// Longest trigger timer interval the B2900 accepts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(100_000);

/// Constant-level acquisition on a timer trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSweep {
    pub mode: SourceMode,
    /// Source value held for the whole acquisition
    pub level: f64,
    pub points: u32,
    pub interval: Duration,
}

impl TimeSweep {
    pub fn validate(&self) -> SmuResult<()> {
        validate_points(self.points)?;
        validate_finite("level", self.level)?;
        if self.interval < MIN_INTERVAL || self.interval > MAX_INTERVAL {
            return Err(SmuError::InvalidArgument(format!(
                "interval must be within {MIN_INTERVAL:?}..={MAX_INTERVAL:?}, got {:?}",
                self.interval
            )));
        }
        Ok(())
    }

    /// Nominal acquisition time.
    pub fn duration(&self) -> Duration {
        self.interval * self.points
    }
}

/// Staircase sweep on the automatic internal trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSweep {
    pub mode: SourceMode,
    pub start: f64,
    pub stop: f64,
    pub points: u32,
}

impl LinearSweep {
    pub fn validate(&self) -> SmuResult<()> {
        validate_points(self.points)?;
        validate_finite("start", self.start)?;
        validate_finite("stop", self.stop)
    }

    /// Source value of step `index`.
    pub fn step_value(&self, index: u32) -> f64 {
        if self.points <= 1 {
            return self.start;
        }
        self.start + (self.stop - self.start) * f64::from(index) / f64::from(self.points - 1)
    }
}

fn validate_points(points: u32) -> SmuResult<()> {
    if (1..=MAX_POINTS).contains(&points) {
        Ok(())
    } else {
        Err(SmuError::InvalidArgument(format!(
            "points must be within 1..={MAX_POINTS}, got {points}"
        )))
    }
}

fn validate_finite(what: &str, value: f64) -> SmuResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SmuError::InvalidArgument(format!(
            "{what} must be a finite number, got {value}"
        )))
    }
}

/// One acquired point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub index: usize,
    /// Seconds since the first trigger
    pub time: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Arrays fetched after a sweep. All three have the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub channel: Channel,
    pub started_at: DateTime<Utc>,
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
}

impl SweepResult {
    /// # Errors
    /// `Parse` if the arrays differ in length.
    pub fn new(
        channel: Channel,
        started_at: DateTime<Utc>,
        time: Vec<f64>,
        voltage: Vec<f64>,
        current: Vec<f64>,
    ) -> SmuResult<Self> {
        if time.len() != voltage.len() || time.len() != current.len() {
            return Err(SmuError::parse(
                format!(":FETC:ARR? (@{channel})"),
                format!(
                    "array lengths differ: time={}, voltage={}, current={}",
                    time.len(),
                    voltage.len(),
                    current.len()
                ),
            ));
        }
        Ok(Self {
            channel,
            started_at,
            time,
            voltage,
            current,
        })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        self.time
            .iter()
            .zip(&self.voltage)
            .zip(&self.current)
            .enumerate()
            .map(|(index, ((&time, &voltage), &current))| SweepPoint {
                index,
                time,
                voltage,
                current,
            })
    }

    /// Write one CSV row per point, with a header row.
    #[cfg(feature = "storage_csv")]
    pub fn write_csv<P: AsRef<std::path::Path>>(&self, path: P) -> SmuResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for point in self.points() {
            writer.serialize(point)?;
        }
        writer.flush()?;
        tracing::info!(
            path = %path.as_ref().display(),
            points = self.len(),
            "Sweep written to CSV"
        );
        Ok(())
    }
}

impl KeysightB2900 {
    #[instrument(skip(self, ch), fields(channel = %ch))]
    pub(crate) async fn run_time_sweep(&self, ch: Channel, sweep: &TimeSweep) -> SmuResult<SweepResult> {
        sweep.validate()?;

        self.set_source_mode(ch, sweep.mode).await?;
        self.write_command(&command::source_shape(ch, sweep.mode, SourceShape::Fixed))
            .await?;
        self.set_level(ch, sweep.mode, sweep.level).await?;
        self.write_command(&command::sense_functions_all(ch)).await?;
        self.write_command(&command::trigger_source(ch, TriggerSource::Timer))
            .await?;
        self.write_command(&command::trigger_timer(ch, sweep.interval))
            .await?;
        self.write_command(&command::trigger_count(ch, sweep.points))
            .await?;

        self.acquire(ch, sweep.duration()).await
    }

    #[instrument(skip(self, ch), fields(channel = %ch))]
    pub(crate) async fn run_linear_sweep(&self, ch: Channel, sweep: &LinearSweep) -> SmuResult<SweepResult> {
        sweep.validate()?;

        self.set_source_mode(ch, sweep.mode).await?;
        self.write_command(&command::source_shape(ch, sweep.mode, SourceShape::Sweep))
            .await?;
        for line in command::sweep_range(ch, sweep.mode, sweep.start, sweep.stop, sweep.points) {
            self.write_command(&line).await?;
        }
        self.write_command(&command::sense_functions_all(ch)).await?;
        self.write_command(&command::trigger_source(ch, TriggerSource::AutoInternal))
            .await?;
        self.write_command(&command::trigger_count(ch, sweep.points))
            .await?;

        // No timer: budget 1 s per point on top of the transport timeout
        let estimate = Duration::from_secs(u64::from(sweep.points));
        self.acquire(ch, estimate).await
    }

    /// Output on, trigger, wait for completion and fetch the three arrays.
    async fn acquire(&self, ch: Channel, expected: Duration) -> SmuResult<SweepResult> {
        self.set_output_state(ch, OutputState::On).await?;

        let started_at = Utc::now();
        self.write_command(&command::initiate(ch)).await?;

        let wait = expected + self.transport()?.timeout();
        tracing::debug!(?wait, "Waiting for sweep to complete");
        self.wait_operation_complete(wait).await?;

        let time = self.query_f64_list(&command::fetch_array(ch, "TIME")).await?;
        let voltage = self.query_f64_list(&command::fetch_array(ch, "VOLT")).await?;
        let current = self.query_f64_list(&command::fetch_array(ch, "CURR")).await?;

        let result = SweepResult::new(ch, started_at, time, voltage, current)?;
        tracing::info!(points = result.len(), "Sweep complete");
        Ok(result)
    }
}
