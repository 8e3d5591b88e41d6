//! native-driver: client for external parser subprocesses.
//!
//! A driver is a single-purpose program that reads parse requests on stdin
//! and writes syntax trees on stdout, one JSON object per line. This crate
//! owns that process, frames the protocol, and matches each answer to its
//! caller even when callers give up early.

pub mod bridge;
pub mod config;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod router;
pub mod transport;

pub use config::DriverConfig;
pub use driver::{Driver, DriverStatus, NativeParser};
pub use encoding::Encoding;
pub use error::{
    ConfigError, DriverError, EncodingError, FailureCause, ProtocolViolation, StartupError,
};
