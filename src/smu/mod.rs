//! Keysight B2900 session
//!
//! [`KeysightB2900`] owns exactly one transport handle and turns SMU operations
//! into SCPI round trips. Every operation is a single command or a single
//! command/reply pair awaited to completion; nothing is cached except the
//! source ranges used to validate compliance limits.
//!
//! # Usage
//!
//! ```no_run
//! use keysight_smu::{config::SmuConfig, KeysightB2900};
//!
//! # async fn run() -> keysight_smu::SmuResult<()> {
//! let config = SmuConfig::load()?;
//! let mut smu = KeysightB2900::connect(&config).await?;
//!
//! let mut ch1 = smu.chan1();
//! ch1.set_mode_voltage_source().await?;
//! ch1.set_current_limit(0.01).await?;
//! ch1.set_voltage(1.5).await?;
//! ch1.enable_output().await?;
//! let amps = ch1.measure_current().await?;
//! ch1.disable_output().await?;
//!
//! smu.close().await?;
//! # let _ = amps;
//! # Ok(())
//! # }
//! ```

mod channel;
pub mod sweep;

pub use channel::SmuChannel;
pub use sweep::{LinearSweep, SweepPoint, SweepResult, TimeSweep};

use crate::config::{ChannelDefaults, SmuConfig};
use crate::error::{InstrumentError, SmuError, SmuResult};
use crate::scpi::command::{self, Channel, DisplayView, MeasurementSpeed, OutputState, SenseWire, SourceMode};
use crate::scpi::response::{self, Identity};
use crate::transport::{self, ScpiTransport};
use std::time::Duration;
use tracing::instrument;

/// Upper bound on `:SYST:ERR?` reads in one drain. The B2900 queue holds fewer
/// entries than this, so reaching it means the reply is not advancing.
const MAX_ERROR_QUEUE_READS: usize = 64;

/// Cached source ranges of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ChannelRanges {
    voltage: f64,
    current: f64,
}

impl From<&ChannelDefaults> for ChannelRanges {
    fn from(defaults: &ChannelDefaults) -> Self {
        Self {
            voltage: defaults.voltage_range,
            current: defaults.current_range,
        }
    }
}

/// Session with one B2900-series SMU.
pub struct KeysightB2900 {
    transport: Option<Box<dyn ScpiTransport>>,
    identity: Identity,
    defaults: ChannelDefaults,
    ranges: [ChannelRanges; 2],
    verify_commands: bool,
}

impl std::fmt::Debug for KeysightB2900 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysightB2900")
            .field("identity", &self.identity)
            .field("connected", &self.is_connected())
            .field("ranges", &self.ranges)
            .finish()
    }
}

impl KeysightB2900 {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the configured transport and verify the instrument identity.
    pub async fn connect(config: &SmuConfig) -> SmuResult<Self> {
        tracing::info!(
            resource = %config.connection.resource,
            transport = ?config.connection.transport,
            "Connecting to SMU"
        );
        let transport = transport::connect(&config.connection).await?;
        let mut smu = Self::open(transport, &config.connection.expected_model).await?;
        smu.defaults = config.channels.clone();
        smu.ranges = [ChannelRanges::from(&smu.defaults); 2];
        smu.verify_commands = config.connection.verify_commands;
        Ok(smu)
    }

    /// Take ownership of an open transport and check that `*IDN?` reports a
    /// model containing `expected_model`.
    ///
    /// On mismatch the transport is closed and `UnexpectedDevice` returned.
    #[instrument(skip(transport), fields(resource = %transport.resource_name()))]
    pub async fn open(transport: Box<dyn ScpiTransport>, expected_model: &str) -> SmuResult<Self> {
        if expected_model.trim().is_empty() {
            let _ = transport.close().await;
            return Err(SmuError::InvalidArgument(
                "expected model must not be empty".into(),
            ));
        }

        let identity = match Self::query_identity(transport.as_ref()).await {
            Ok(identity) => identity,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };

        if !identity.matches_model(expected_model) {
            tracing::warn!(
                expected = expected_model,
                found = %identity.model,
                "Unexpected device, closing"
            );
            let _ = transport.close().await;
            return Err(SmuError::UnexpectedDevice {
                expected: expected_model.to_string(),
                found: identity.model,
            });
        }

        tracing::info!(identity = %identity, "SMU session opened");

        let defaults = ChannelDefaults::default();
        Ok(Self {
            transport: Some(transport),
            identity,
            ranges: [ChannelRanges::from(&defaults); 2],
            defaults,
            verify_commands: false,
        })
    }

    async fn query_identity(transport: &dyn ScpiTransport) -> SmuResult<Identity> {
        let reply = transport.query(command::IDENTIFY).await?;
        Identity::parse(&reply)
    }

    /// Run the instrument error check after every command.
    pub fn with_verify_commands(mut self, enabled: bool) -> Self {
        self.verify_commands = enabled;
        self
    }

    /// Close the transport. Calling it again is a no-op.
    pub async fn close(&mut self) -> SmuResult<()> {
        match self.transport.take() {
            Some(transport) => {
                transport.close().await?;
                tracing::info!(resource = %transport.resource_name(), "SMU session closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_connected())
    }

    /// Identity reported when the session was opened.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Resource string of the open transport.
    pub fn resource_name(&self) -> SmuResult<&str> {
        Ok(self.transport()?.resource_name())
    }

    // =========================================================================
    // Raw I/O
    // =========================================================================

    fn transport(&self) -> SmuResult<&dyn ScpiTransport> {
        self.transport.as_deref().ok_or(SmuError::NotConnected)
    }

    /// Send a raw command line.
    pub async fn write_command(&self, command: &str) -> SmuResult<()> {
        self.transport()?.write(command).await?;
        if self.verify_commands {
            self.ensure_no_errors().await?;
        }
        Ok(())
    }

    /// Send a raw query and return the trimmed reply.
    pub async fn write_query(&self, query: &str) -> SmuResult<String> {
        self.transport()?.query(query).await
    }

    async fn query_f64(&self, query: &str) -> SmuResult<f64> {
        let reply = self.write_query(query).await?;
        response::parse_f64(query, &reply)
    }

    async fn query_f64_list(&self, query: &str) -> SmuResult<Vec<f64>> {
        let reply = self.write_query(query).await?;
        response::parse_f64_list(query, &reply)
    }

    // =========================================================================
    // Instrument-level commands
    // =========================================================================

    /// `*RST`. The cached channel ranges return to their defaults.
    pub async fn reset(&mut self) -> SmuResult<()> {
        self.write_command(command::RESET).await?;
        self.ranges = [ChannelRanges::from(&self.defaults); 2];
        Ok(())
    }

    /// `*CLS`, clears the status registers and the error queue.
    pub async fn clear_status(&self) -> SmuResult<()> {
        self.write_command(command::CLEAR_STATUS).await
    }

    /// Turn the front panel display on or off and optionally select a view.
    pub async fn set_display(&self, enabled: bool, view: Option<DisplayView>) -> SmuResult<()> {
        self.write_command(&command::display_enable(enabled)).await?;
        if let Some(view) = view {
            self.write_command(&command::display_view(view)).await?;
        }
        Ok(())
    }

    /// Read `:SYST:ERR?` until the queue reports `0,"No error"`.
    pub async fn check_errors(&self) -> SmuResult<Vec<InstrumentError>> {
        let mut errors = Vec::new();
        let mut last_reply = String::new();
        for _ in 0..MAX_ERROR_QUEUE_READS {
            last_reply = self.write_query(command::NEXT_ERROR).await?;
            let entry = response::parse_error_entry(&last_reply)?;
            if entry.is_no_error() {
                return Ok(errors);
            }
            tracing::warn!(code = entry.code, message = %entry.message, "Instrument error");
            errors.push(entry);
        }
        // The instrument answered every read, it just never reported the end
        Err(SmuError::parse(
            command::NEXT_ERROR,
            format!("{last_reply} (queue not empty after {MAX_ERROR_QUEUE_READS} reads)"),
        ))
    }

    /// Fail with the first queued instrument error, if any.
    pub async fn ensure_no_errors(&self) -> SmuResult<()> {
        match self.check_errors().await?.into_iter().next() {
            Some(first) => Err(SmuError::Instrument(first)),
            None => Ok(()),
        }
    }

    /// Block on `*OPC?` for at most `timeout`.
    pub async fn wait_operation_complete(&self, timeout: Duration) -> SmuResult<()> {
        let reply = self
            .transport()?
            .query_with_timeout(command::OPERATION_COMPLETE, timeout)
            .await?;
        if response::parse_bool(command::OPERATION_COMPLETE, &reply)? {
            Ok(())
        } else {
            Err(SmuError::parse(command::OPERATION_COMPLETE, reply))
        }
    }

    // =========================================================================
    // Channels
    // =========================================================================

    pub fn channel(&mut self, channel: Channel) -> SmuChannel<'_> {
        SmuChannel::new(self, channel)
    }

    pub fn chan1(&mut self) -> SmuChannel<'_> {
        self.channel(Channel::One)
    }

    pub fn chan2(&mut self) -> SmuChannel<'_> {
        self.channel(Channel::Two)
    }

    pub(crate) fn voltage_range(&self, ch: Channel) -> f64 {
        self.ranges[ch.index()].voltage
    }

    pub(crate) fn current_range(&self, ch: Channel) -> f64 {
        self.ranges[ch.index()].current
    }

    // =========================================================================
    // Primitives used by SmuChannel
    // =========================================================================

    pub(crate) async fn set_measurement_speed(
        &self,
        ch: Channel,
        sense: SourceMode,
        speed: MeasurementSpeed,
    ) -> SmuResult<()> {
        self.write_command(&command::measurement_speed(ch, sense, speed))
            .await
    }

    pub(crate) async fn set_source_mode(&self, ch: Channel, mode: SourceMode) -> SmuResult<()> {
        self.write_command(&command::source_mode(ch, mode)).await
    }

    pub(crate) async fn set_sense_wire_mode(&self, ch: Channel, wire: SenseWire) -> SmuResult<()> {
        self.write_command(&command::sense_wire_mode(ch, wire)).await
    }

    /// Compliance limit of `sense`, checked against the cached range.
    pub(crate) async fn set_limit(&self, ch: Channel, sense: SourceMode, value: f64) -> SmuResult<()> {
        require_finite("limit", value)?;
        let range = match sense {
            SourceMode::Voltage => self.voltage_range(ch),
            SourceMode::Current => self.current_range(ch),
        };
        if value > range {
            return Err(SmuError::LimitOutOfRange {
                limit: value,
                range,
                unit: sense.unit(),
            });
        }
        self.write_command(&command::limit(ch, sense, value)).await
    }

    pub(crate) async fn set_level(&self, ch: Channel, mode: SourceMode, value: f64) -> SmuResult<()> {
        require_finite("level", value)?;
        self.write_command(&command::level(ch, mode, value)).await
    }

    pub(crate) async fn set_range(&mut self, ch: Channel, mode: SourceMode, value: f64) -> SmuResult<()> {
        require_finite("range", value)?;
        if value <= 0.0 {
            return Err(SmuError::InvalidArgument(format!(
                "range must be positive, got {value}"
            )));
        }
        self.write_command(&command::source_range(ch, mode, value))
            .await?;
        let ranges = &mut self.ranges[ch.index()];
        match mode {
            SourceMode::Voltage => ranges.voltage = value,
            SourceMode::Current => ranges.current = value,
        }
        Ok(())
    }

    pub(crate) async fn set_output_state(&self, ch: Channel, state: OutputState) -> SmuResult<()> {
        self.write_command(&command::output_state(ch, state)).await
    }

    pub(crate) async fn output_state(&self, ch: Channel) -> SmuResult<bool> {
        let query = command::output_state_query(ch);
        let reply = self.write_query(&query).await?;
        response::parse_bool(&query, &reply)
    }

    pub(crate) async fn measure(&self, ch: Channel, mode: SourceMode) -> SmuResult<f64> {
        self.query_f64(&command::measure(ch, mode)).await
    }

    pub(crate) async fn measure_resistance(&self, ch: Channel) -> SmuResult<f64> {
        self.query_f64(&command::measure_resistance(ch)).await
    }
}

fn require_finite(what: &str, value: f64) -> SmuResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SmuError::InvalidArgument(format!(
            "{what} must be a finite number, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use tracing_test::traced_test;

    async fn mock_session() -> (KeysightB2900, MockTransport) {
        let mock = MockTransport::new();
        let smu = KeysightB2900::open(Box::new(mock.clone()), "B2902B")
            .await
            .unwrap();
        mock.clear_call_log();
        (smu, mock)
    }

    #[tokio::test]
    async fn test_open_checks_model() {
        let (smu, _mock) = mock_session().await;
        assert_eq!(smu.identity().model, "B2902B");
        assert!(smu.is_connected());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_rejects_other_model() {
        let mock = MockTransport::new().with_identity("Keysight Technologies,B2912A,MY1,1.0");
        let result = KeysightB2900::open(Box::new(mock.clone()), "B2902B").await;
        match result {
            Err(SmuError::UnexpectedDevice { expected, found }) => {
                assert_eq!(expected, "B2902B");
                assert_eq!(found, "B2912A");
            }
            other => panic!("expected UnexpectedDevice, got {:?}", other),
        }
        assert!(!mock.is_connected());
        assert!(logs_contain("Unexpected device, closing"));
    }

    #[tokio::test]
    async fn test_open_rejects_empty_model() {
        let mock = MockTransport::new();
        let result = KeysightB2900::open(Box::new(mock.clone()), "").await;
        assert!(matches!(result, Err(SmuError::InvalidArgument(_))));
        assert!(!mock.is_connected());
        assert!(mock.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut smu, mock) = mock_session().await;
        smu.close().await.unwrap();
        smu.close().await.unwrap();
        assert!(!smu.is_connected());
        assert!(!mock.is_connected());
        assert!(matches!(
            smu.write_command("*RST").await,
            Err(SmuError::NotConnected)
        ));
        assert!(matches!(
            smu.chan1().measure_voltage().await,
            Err(SmuError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reset_restores_ranges() {
        let (mut smu, mock) = mock_session().await;
        smu.chan2().set_voltage_range(2.0).await.unwrap();
        assert_eq!(smu.voltage_range(Channel::Two), 2.0);

        smu.reset().await.unwrap();
        assert_eq!(smu.voltage_range(Channel::Two), 20.0);
        assert_eq!(
            mock.call_log(),
            vec![":SOUR2:VOLT:RANG 2".to_string(), "*RST".to_string()]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_check_errors_drains_queue() {
        let (smu, mock) = mock_session().await;
        mock.push_instrument_error(-222, "Data out of range");
        mock.push_instrument_error(-113, "Undefined header");

        let errors = smu.check_errors().await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, -222);
        assert_eq!(errors[1].message, "Undefined header");
        assert!(smu.check_errors().await.unwrap().is_empty());
        assert!(logs_contain("Instrument error"));
    }

    #[tokio::test]
    async fn test_check_errors_gives_up_on_endless_queue() {
        let (smu, mock) = mock_session().await;
        for _ in 0..=MAX_ERROR_QUEUE_READS {
            mock.push_instrument_error(-350, "Queue overflow");
        }

        let err = smu.check_errors().await.unwrap_err();
        match &err {
            SmuError::Parse { context, response } => {
                assert_eq!(context, ":SYST:ERR?");
                assert!(response.contains("-350"));
            }
            other => panic!("expected Parse, got {:?}", other),
        }
        assert!(!err.is_transport());
        assert_eq!(mock.call_log().len(), MAX_ERROR_QUEUE_READS);
    }

    #[tokio::test]
    async fn test_verify_commands_surfaces_instrument_error() {
        let (smu, _mock) = mock_session().await;
        let smu = smu.with_verify_commands(true);

        smu.write_command(":SOUR1:VOLT 1").await.unwrap();
        match smu.write_command(":SOUR1:VOLT 500").await {
            Err(SmuError::Instrument(err)) => assert_eq!(err.code, -222),
            other => panic!("expected instrument error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_display_commands() {
        let (smu, mock) = mock_session().await;
        smu.set_display(false, Some(DisplayView::Graph)).await.unwrap();
        assert_eq!(
            mock.call_log(),
            vec![":DISP:ENAB OFF".to_string(), ":DISP:VIEW GRAP".to_string()]
        );
        assert!(!mock.display_enabled());
    }

    #[tokio::test]
    async fn test_wait_operation_complete() {
        let (smu, _mock) = mock_session().await;
        smu.wait_operation_complete(Duration::from_millis(50))
            .await
            .unwrap();
    }
}
