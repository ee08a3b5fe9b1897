//! # Keysight B2900 SMU control
//!
//! Helper library for Keysight B2900-series Source Measure Units (B2902B and
//! relatives). It maps SMU operations such as source/measure setup, compliance
//! limits, output control and triggered sweeps to SCPI commands sent over a
//! VISA resource.
//!
//! ## Crate Structure
//!
//! - **`smu`**: [`KeysightB2900`] session and the per-channel [`SmuChannel`] handle,
//!   plus time-domain and staircase sweeps.
//! - **`scpi`**: pure command builders and reply parsers for the B2900 command set.
//! - **`transport`**: the [`ScpiTransport`] trait and its implementations: raw
//!   TCP socket, VISA (feature `instrument_visa`) and a simulated instrument.
//! - **`resource`**: VISA resource string parsing.
//! - **`config`**: figment-based configuration (`config/smu.toml` + environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: the [`SmuError`] enum shared by all of the above.

pub mod config;
pub mod error;
pub mod logging;
pub mod resource;
pub mod scpi;
pub mod smu;
pub mod transport;

pub use error::{SmuError, SmuResult};
pub use scpi::{Channel, MeasurementSpeed, SourceMode};
pub use smu::{KeysightB2900, LinearSweep, SmuChannel, SweepResult, TimeSweep};
pub use transport::ScpiTransport;
