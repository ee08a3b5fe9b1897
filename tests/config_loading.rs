//! Configuration loading from TOML files and environment overrides.
//!
//! Environment variables are process-global, so every test that touches them
//! runs under `#[serial]`.

use keysight_smu::config::{SmuConfig, TransportKind};
use keysight_smu::logging::OutputFormat;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const FULL_CONFIG: &str = r#"
[application]
name = "bench-3"
log_level = "debug"
log_format = "json"

[connection]
resource = "TCPIP0::192.168.1.50::5025::SOCKET"
transport = "auto"
timeout_ms = 3000
connect_timeout_ms = 1000
expected_model = "B2902B"
verify_commands = true

[channels]
voltage_range = 200.0
current_range = 0.1
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("KEYSIGHT_SMU_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_load_full_file() {
    clear_env();
    let file = write_config(FULL_CONFIG);

    let config = SmuConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.name, "bench-3");
    assert_eq!(config.application.log_format, OutputFormat::Json);
    assert_eq!(config.connection.transport, TransportKind::Auto);
    assert_eq!(config.connection.timeout_ms, 3000);
    assert!(config.connection.verify_commands);
    assert_eq!(config.channels.voltage_range, 200.0);
    assert_eq!(config.channels.current_range, 0.1);
}

#[test]
#[serial]
fn test_partial_file_keeps_defaults() {
    clear_env();
    let file = write_config("[connection]\nresource = \"GPIB0::23::INSTR\"\n");

    let config = SmuConfig::load_from(file.path()).unwrap();
    assert_eq!(config.connection.resource, "GPIB0::23::INSTR");
    assert_eq!(config.connection.timeout_ms, 2000);
    assert_eq!(config.connection.write_terminator, "\n");
    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.channels.voltage_range, 20.0);
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = SmuConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, SmuConfig::default());
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = write_config(FULL_CONFIG);
    std::env::set_var("KEYSIGHT_SMU_CONNECTION__RESOURCE", "TCPIP0::10.0.0.7::5025::SOCKET");
    std::env::set_var("KEYSIGHT_SMU_APPLICATION__LOG_LEVEL", "warn");
    std::env::set_var("KEYSIGHT_SMU_CHANNELS__CURRENT_RANGE", "1.5");

    let config = SmuConfig::load_from(file.path());
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.connection.resource, "TCPIP0::10.0.0.7::5025::SOCKET");
    assert_eq!(config.application.log_level, "warn");
    assert_eq!(config.channels.current_range, 1.5);
    assert_eq!(config.channels.voltage_range, 200.0);
}

#[test]
#[serial]
fn test_bad_value_is_config_error() {
    clear_env();
    let file = write_config("[connection]\ntimeout_ms = \"soon\"\n");
    let err = SmuConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"));
}

#[test]
#[serial]
fn test_validation_after_load() {
    clear_env();
    let file = write_config("[channels]\nvoltage_range = 0.0\n");
    let config = SmuConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("voltage_range"));
}
