//! Error types for the Keithley drivers.
//!
//! `KeithleyError` is the single error type returned by the transport, controller,
//! and channel layers. None of these errors are retried internally; each one is
//! propagated to the caller (usually a plugin hook, and from there the host).
//!
//! ## Error Kinds
//!
//! - **`Connection`**: the resource could not be opened (bad address, device not
//!   present, bus error).
//! - **`Timeout`**: no reply arrived within the transport deadline.
//! - **`Parse`**: a reply did not have the expected numeric or tabular shape.
//! - **`Sweep`**: the buffer-availability status after a sweep trigger was not `2`.
//! - **`UnsupportedMode`**: a source type outside {Voltage, Current}.
//! - **`NotConnected`**: the controller was already closed.
//!
//! The remaining variants cover configuration and plain I/O failures.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, KeithleyError>;

#[derive(Error, Debug)]
pub enum KeithleyError {
    #[error("Failed to open resource '{resource}': {reason}")]
    Connection { resource: String, reason: String },

    #[error("Timeout waiting for reply to: {0}")]
    Timeout(String),

    #[error("Failed to parse instrument reply '{reply}': {reason}")]
    Parse { reply: String, reason: String },

    #[error("Sweep buffers not available: status {status} != 2")]
    Sweep { status: String },

    #[error("Unsupported source type: '{0}' (expected Voltage or Current)")]
    UnsupportedMode(String),

    #[error("Instrument connection is closed")]
    NotConnected,

    #[error("Invalid channel name '{0}': expected a single letter such as A or B")]
    InvalidChannel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl KeithleyError {
    pub(crate) fn parse(reply: &str, reason: impl Into<String>) -> Self {
        KeithleyError::Parse {
            reply: reply.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(resource: &str, reason: impl std::fmt::Display) -> Self {
        KeithleyError::Connection {
            resource: resource.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure came from the instrument link itself rather than
    /// from a reply that arrived but could not be used.
    #[must_use]
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            KeithleyError::Connection { .. }
                | KeithleyError::Timeout(_)
                | KeithleyError::NotConnected
                | KeithleyError::Io(_)
        )
    }
}

impl From<figment::Error> for KeithleyError {
    fn from(value: figment::Error) -> Self {
        KeithleyError::Config(value.to_string())
    }
}
