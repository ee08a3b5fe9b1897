use super::sweep::{LinearSweep, SweepResult, TimeSweep};
use super::KeysightB2900;
use crate::error::{SmuError, SmuResult};
use crate::scpi::command::{Channel, MeasurementSpeed, OutputState, SenseWire, SourceMode};

/// Handle on one output channel of a [`KeysightB2900`].
///
/// Borrows the session mutably, so only one channel handle is alive at a time
/// and calls cannot interleave.
pub struct SmuChannel<'a> {
    session: &'a mut KeysightB2900,
    channel: Channel,
}

impl<'a> SmuChannel<'a> {
    pub(crate) fn new(session: &'a mut KeysightB2900, channel: Channel) -> Self {
        Self { session, channel }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Voltage range used to validate [`set_voltage_limit`](Self::set_voltage_limit).
    pub fn voltage_range(&self) -> f64 {
        self.session.voltage_range(self.channel)
    }

    /// Current range used to validate [`set_current_limit`](Self::set_current_limit).
    pub fn current_range(&self) -> f64 {
        self.session.current_range(self.channel)
    }

    // =========================================================================
    // Source configuration
    // =========================================================================

    pub async fn set_mode_voltage_source(&mut self) -> SmuResult<()> {
        self.session
            .set_source_mode(self.channel, SourceMode::Voltage)
            .await
    }

    pub async fn set_mode_current_source(&mut self) -> SmuResult<()> {
        self.session
            .set_source_mode(self.channel, SourceMode::Current)
            .await
    }

    /// Fixed voltage source range, in volts.
    pub async fn set_voltage_range(&mut self, volts: f64) -> SmuResult<()> {
        self.session
            .set_range(self.channel, SourceMode::Voltage, volts)
            .await
    }

    /// Fixed current source range, in amperes.
    pub async fn set_current_range(&mut self, amps: f64) -> SmuResult<()> {
        self.session
            .set_range(self.channel, SourceMode::Current, amps)
            .await
    }

    /// Voltage compliance, effective while sourcing current.
    ///
    /// # Errors
    /// `LimitOutOfRange` if `volts` exceeds the voltage range; nothing is sent.
    pub async fn set_voltage_limit(&mut self, volts: f64) -> SmuResult<()> {
        self.session
            .set_limit(self.channel, SourceMode::Voltage, volts)
            .await
    }

    /// Current compliance, effective while sourcing voltage.
    ///
    /// # Errors
    /// `LimitOutOfRange` if `amps` exceeds the current range; nothing is sent.
    pub async fn set_current_limit(&mut self, amps: f64) -> SmuResult<()> {
        self.session
            .set_limit(self.channel, SourceMode::Current, amps)
            .await
    }

    pub async fn set_voltage(&mut self, volts: f64) -> SmuResult<()> {
        self.session
            .set_level(self.channel, SourceMode::Voltage, volts)
            .await
    }

    pub async fn set_current(&mut self, amps: f64) -> SmuResult<()> {
        self.session
            .set_level(self.channel, SourceMode::Current, amps)
            .await
    }

    pub async fn enable_output(&mut self) -> SmuResult<()> {
        self.session
            .set_output_state(self.channel, OutputState::On)
            .await
    }

    pub async fn disable_output(&mut self) -> SmuResult<()> {
        self.session
            .set_output_state(self.channel, OutputState::Off)
            .await
    }

    pub async fn output_enabled(&mut self) -> SmuResult<bool> {
        self.session.output_state(self.channel).await
    }

    // =========================================================================
    // Sense configuration
    // =========================================================================

    /// Integration time for both voltage and current measurements.
    pub async fn set_measurement_speed(&mut self, speed: MeasurementSpeed) -> SmuResult<()> {
        let nplc = speed.nplc();
        if !nplc.is_finite() || nplc <= 0.0 {
            return Err(SmuError::InvalidArgument(format!(
                "NPLC must be positive, got {nplc}"
            )));
        }
        for sense in [SourceMode::Voltage, SourceMode::Current] {
            self.session
                .set_measurement_speed(self.channel, sense, speed)
                .await?;
        }
        Ok(())
    }

    /// Remote (four-wire) sensing on or off.
    pub async fn set_four_wire(&mut self, enabled: bool) -> SmuResult<()> {
        let wire = if enabled {
            SenseWire::FourWire
        } else {
            SenseWire::TwoWire
        };
        self.session.set_sense_wire_mode(self.channel, wire).await
    }

    // =========================================================================
    // Spot measurements
    // =========================================================================
    // The instrument switches the output on by itself for a spot measurement.

    pub async fn measure_voltage(&mut self) -> SmuResult<f64> {
        self.session.measure(self.channel, SourceMode::Voltage).await
    }

    pub async fn measure_current(&mut self) -> SmuResult<f64> {
        self.session.measure(self.channel, SourceMode::Current).await
    }

    pub async fn measure_resistance(&mut self) -> SmuResult<f64> {
        self.session.measure_resistance(self.channel).await
    }

    /// Power delivered to the load, from one voltage and one current reading.
    pub async fn measure_power(&mut self) -> SmuResult<f64> {
        let volts = self.measure_voltage().await?;
        let amps = self.measure_current().await?;
        Ok(volts * amps)
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Hold a constant source level and sample at a fixed interval.
    pub async fn time_domain_sweep(&mut self, sweep: &TimeSweep) -> SmuResult<SweepResult> {
        self.session.run_time_sweep(self.channel, sweep).await
    }

    /// Staircase sweep from `start` to `stop`.
    pub async fn linear_sweep(&mut self, sweep: &LinearSweep) -> SmuResult<SweepResult> {
        self.session.run_linear_sweep(self.channel, sweep).await
    }
}
