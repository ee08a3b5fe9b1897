//! Integration tests for the SMU session against the simulated B2902B
//!
//! These tests drive the public API end to end through `MockTransport` and
//! check both the values returned and the SCPI lines that reached the
//! instrument.

use keysight_smu::config::SmuConfig;
use keysight_smu::scpi::response::is_overflow;
use keysight_smu::transport::MockTransport;
use keysight_smu::{
    Channel, KeysightB2900, LinearSweep, MeasurementSpeed, SmuError, SourceMode, TimeSweep,
};
use std::time::Duration;

async fn open_mock(mock: &MockTransport) -> KeysightB2900 {
    let smu = KeysightB2900::open(Box::new(mock.clone()), "B2902B")
        .await
        .unwrap();
    mock.clear_call_log();
    smu
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn test_connect_with_default_config_uses_mock() {
    let mut smu = KeysightB2900::connect(&SmuConfig::default()).await.unwrap();
    assert!(smu.is_connected());
    assert_eq!(smu.identity().manufacturer, "Keysight Technologies");
    assert_eq!(
        smu.resource_name().unwrap(),
        "USB0::2391::12345::XY00001234::0::INSTR"
    );

    smu.close().await.unwrap();
    assert!(!smu.is_connected());
    assert!(matches!(smu.resource_name(), Err(SmuError::NotConnected)));
}

#[tokio::test]
async fn test_closed_session_reports_device_not_connected() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;
    smu.close().await.unwrap();

    let err = smu.write_query("*IDN?").await.unwrap_err();
    assert_eq!(err.to_string(), "Device not connected.");
    assert!(smu.reset().await.is_err());
    assert!(mock.call_log().is_empty());
}

#[tokio::test]
async fn test_transport_failure_surfaces_unchanged() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;

    mock.trigger_failure();
    let err = smu.chan1().measure_voltage().await.unwrap_err();
    assert!(err.is_transport());

    // Nothing is retried, the next call goes through normally
    smu.chan1().measure_voltage().await.unwrap();
}

#[tokio::test]
async fn test_raw_pass_through() {
    let mock = MockTransport::new();
    let smu = open_mock(&mock).await;

    smu.write_command(":SOUR2:CURR 1e-3").await.unwrap();
    let reply = smu.write_query(":OUTP2?").await.unwrap();
    assert_eq!(reply, "0");
    assert_eq!(mock.call_log(), vec![":SOUR2:CURR 1e-3", ":OUTP2?"]);
}

// =============================================================================
// Source / measure workflows
// =============================================================================

#[tokio::test]
async fn test_current_source_with_voltage_compliance() {
    let mock = MockTransport::new().with_load(2, 10_000.0);
    let mut smu = open_mock(&mock).await;

    let mut ch = smu.chan2();
    ch.set_mode_current_source().await.unwrap();
    ch.set_voltage_limit(5.0).await.unwrap();
    ch.set_current(1e-3).await.unwrap();
    ch.enable_output().await.unwrap();

    // 1 mA into 10 kOhm would need 10 V, so the channel sits at the 5 V limit
    let volts = ch.measure_voltage().await.unwrap();
    let amps = ch.measure_current().await.unwrap();
    assert!((volts - 5.0).abs() < 1e-9);
    assert!((amps - 5e-4).abs() < 1e-12);

    assert_eq!(
        mock.call_log()[..4],
        [
            ":SOUR2:FUNC:MODE CURR",
            ":SENS2:VOLT:PROT 5",
            ":SOUR2:CURR 0.001",
            ":OUTP2 ON",
        ]
    );
}

#[tokio::test]
async fn test_channels_are_independent() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;

    smu.chan1().enable_output().await.unwrap();
    assert!(smu.chan1().output_enabled().await.unwrap());
    assert!(!smu.chan2().output_enabled().await.unwrap());

    smu.channel(Channel::Two).set_voltage_range(2.0).await.unwrap();
    assert_eq!(smu.chan1().voltage_range(), 20.0);
    assert_eq!(smu.chan2().voltage_range(), 2.0);
}

#[tokio::test]
async fn test_resistance_without_current_is_overflow() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;

    let ohms = smu.chan1().measure_resistance().await.unwrap();
    assert!(is_overflow(ohms));
}

#[tokio::test]
async fn test_instrument_errors_are_reported() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;

    smu.chan1().set_voltage(250.0).await.unwrap();
    match smu.ensure_no_errors().await {
        Err(SmuError::Instrument(err)) => {
            assert_eq!(err.code, -222);
            assert_eq!(err.message, "Data out of range");
        }
        other => panic!("expected instrument error, got {:?}", other),
    }
    smu.ensure_no_errors().await.unwrap();

    mock.push_instrument_error(-113, "Undefined header");
    smu.clear_status().await.unwrap();
    assert!(smu.check_errors().await.unwrap().is_empty());
}

// =============================================================================
// Sweeps
// =============================================================================

#[tokio::test]
async fn test_linear_voltage_sweep_iv_curve() {
    let mock = MockTransport::new().with_load(1, 1_000.0);
    let mut smu = open_mock(&mock).await;

    let mut ch = smu.chan1();
    ch.set_measurement_speed(MeasurementSpeed::Fast).await.unwrap();
    ch.set_current_limit(0.1).await.unwrap();
    let result = ch
        .linear_sweep(&LinearSweep {
            mode: SourceMode::Voltage,
            start: 0.0,
            stop: 5.0,
            points: 6,
        })
        .await
        .unwrap();

    assert_eq!(result.len(), 6);
    for (point, expected) in result.points().zip([0.0, 1.0, 2.0, 3.0, 4.0, 5.0]) {
        assert!((point.voltage - expected).abs() < 1e-9);
        assert!((point.current - expected / 1_000.0).abs() < 1e-12);
    }

    let log = mock.call_log();
    assert!(log.contains(&":SOUR1:VOLT:MODE SWE".to_string()));
    assert!(log.contains(&":SOUR1:VOLT:STAR 0".to_string()));
    assert!(log.contains(&":SOUR1:VOLT:STOP 5".to_string()));
    assert!(log.contains(&":SOUR1:VOLT:POIN 6".to_string()));
    assert!(log.contains(&":TRIG1:SOUR AINT".to_string()));
    assert!(log.contains(&":TRIG1:COUN 6".to_string()));
}

#[tokio::test]
async fn test_time_sweep_on_channel_two() {
    let mock = MockTransport::new().with_load(2, 50.0);
    let mut smu = open_mock(&mock).await;

    let mut ch = smu.chan2();
    ch.set_voltage_limit(10.0).await.unwrap();
    let result = ch
        .time_domain_sweep(&TimeSweep {
            mode: SourceMode::Current,
            level: 0.02,
            points: 10,
            interval: Duration::from_millis(10),
        })
        .await
        .unwrap();

    assert_eq!(result.channel, Channel::Two);
    assert_eq!(result.len(), 10);
    assert!(result.voltage.iter().all(|v| (v - 1.0).abs() < 1e-9));
    assert!((result.time[9] - 0.09).abs() < 1e-9);
    assert!(mock.output_on(2));
}

#[tokio::test]
async fn test_sweep_validation_rejects_bad_interval() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;

    let err = smu
        .chan1()
        .time_domain_sweep(&TimeSweep {
            mode: SourceMode::Voltage,
            level: 1.0,
            points: 10,
            interval: Duration::from_micros(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SmuError::InvalidArgument(_)));
    assert!(mock.call_log().is_empty());
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn test_sweep_csv_export() {
    let mock = MockTransport::new();
    let mut smu = open_mock(&mock).await;
    let result = smu
        .chan1()
        .linear_sweep(&LinearSweep {
            mode: SourceMode::Voltage,
            start: -0.05,
            stop: 0.05,
            points: 3,
        })
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iv.csv");
    result.write_csv(&path).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "index,time,voltage,current");
    assert!(lines[1].starts_with("0,"));
    assert!(lines[3].starts_with("2,"));
}
