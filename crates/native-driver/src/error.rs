//! Error taxonomy for driver lifecycle and parse calls.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;
use tokio_util::codec::AnyDelimiterCodecError;

use crate::driver::DriverStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown encoding '{0}', expected 'utf8' or 'base64'")]
    UnknownEncoding(String),

    #[error("no driver executable configured")]
    MissingProgram,

    #[error("invalid timeout '{0}', expected milliseconds")]
    InvalidTimeout(String),
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("process exited immediately with {0}")]
    ExitedImmediately(ExitStatus),

    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

/// The driver broke the wire protocol, or the pipe to it did.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("malformed response line {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read response: {0}")]
    Read(#[source] AnyDelimiterCodecError),

    #[error("failed to write request: {0}")]
    Write(#[source] AnyDelimiterCodecError),

    #[error("driver closed its output")]
    Closed,
}

/// Why a parse call against a running driver failed.
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error("timed out waiting for driver response")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("driver reported failure: {0}")]
    Reported(String),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver failed to start: {0}")]
    Startup(#[from] StartupError),

    #[error("driver failure: {0}")]
    Failure(#[from] FailureCause),

    #[error("cannot {operation} a driver that is {status}")]
    InvalidState {
        operation: &'static str,
        status: DriverStatus,
    },

    #[error("driver closed while the call was pending")]
    Closed,

    #[error("failed to terminate driver: {0}")]
    Close(#[source] io::Error),
}

impl DriverError {
    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Self::Failure(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause(), Some(FailureCause::Timeout))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.cause(), Some(FailureCause::Protocol(_)))
    }

    pub fn is_reported(&self) -> bool {
        matches!(self.cause(), Some(FailureCause::Reported(_)))
    }
}

impl From<ProtocolViolation> for DriverError {
    fn from(violation: ProtocolViolation) -> Self {
        Self::Failure(FailureCause::Protocol(violation))
    }
}
