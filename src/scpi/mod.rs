//! SCPI command construction and reply parsing for the B2900 command set.

pub mod command;
pub mod response;

pub use command::{
    Channel, DisplayView, MeasurementSpeed, OutputState, SenseWire, SourceMode,
};
pub use response::Identity;
