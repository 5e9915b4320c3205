//! Custom error types for the communication layer.
//!
//! This module defines the primary error type, `LinkError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between the host and the board, from configuration
//! problems to protocol violations and peer-reported upload failures.
//!
//! ## Error Hierarchy
//!
//! `LinkError` falls into four broad groups:
//!
//! 1. **Configuration** - `Config`, `Configuration`
//!    - Raised while loading or validating `LinkConfig`.
//!    - Permanent: fix the file or environment and restart.
//!
//! 2. **Link / transport** - `Transport`, `NotConnected`, `ConnectInProgress`, `Closed`
//!    - `Transport` wraps [`TransportError`] verbatim so the platform message reaches
//!      the caller untouched.
//!    - `NotConnected` is raised by every data operation attempted while no
//!      characteristic handles are bound.
//!
//! 3. **Protocol** - `Length`, `Protocol`, `Dimension`
//!    - Firmware/host mismatches. Never defaulted, always raised with the byte counts
//!      or dimensions needed to diagnose without re-running.
//!    - Sensor-frame corruption is *not* in this group: the codec drops those frames
//!      and returns `None`.
//!
//! 4. **Upload / stream usage** - `UploadInProgress`, `UploadCancelled`,
//!    `UploadRejected`, `UploadTimeout`, `StreamConflict`
//!    - Usage errors are raised before the link is touched.
//!    - `UploadRejected` carries the numeric result code reported by the peer.
//!
//! By using `#[from]`, `LinkError` is created from transport, I/O and figment errors
//! with the `?` operator.

use thiserror::Error;

use crate::protocol::StreamMode;
use crate::transport::TransportError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LinkError>;

/// Primary error type for the communication layer.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Configuration sources could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure (CLI file access, blob export).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The wireless stack reported an error. The message is the platform's own.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A data operation was attempted while no link handles are bound.
    #[error("Not connected to a device")]
    NotConnected,

    /// `connect()` was called while a connect or silent reconnect is in flight.
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// The connection manager has been closed.
    #[error("Connection manager is closed")]
    Closed,

    /// A link came up after the user had already disconnected; it was dropped.
    #[error("Connection attempt superseded by a newer request")]
    Superseded,

    /// A fixed-size record arrived shorter than its layout.
    #[error("{packet} packet too short: expected at least {expected} bytes, got {actual}")]
    Length {
        /// Packet name, e.g. "device info"
        packet: &'static str,
        /// Minimum number of bytes the layout requires
        expected: usize,
        /// Number of bytes actually received
        actual: usize,
    },

    /// Any other violation of the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A weight tensor or label table does not match the device model layout.
    #[error("Dimension mismatch in {what}: expected {expected}, got {actual}")]
    Dimension {
        /// Which tensor or table was checked
        what: String,
        /// Value required by the device layout
        expected: usize,
        /// Value found
        actual: usize,
    },

    /// A second upload was requested while one is in flight.
    #[error("A model upload is already in progress")]
    UploadInProgress,

    /// The upload was cancelled by the caller.
    #[error("Model upload cancelled")]
    UploadCancelled,

    /// The device reported a failure result code after Complete.
    #[error("Device rejected model upload: {reason} (code {code})")]
    UploadRejected {
        /// Raw result code from the status characteristic
        code: u8,
        /// Human-readable name of the code
        reason: &'static str,
    },

    /// The device never reported a terminal status.
    #[error("Model upload timed out: {0}")]
    UploadTimeout(String),

    /// A stream mode was started while the other mode is active.
    #[error("Cannot start {requested} stream while {active} stream is active")]
    StreamConflict {
        /// Mode currently streaming
        active: StreamMode,
        /// Mode the caller asked for
        requested: StreamMode,
    },
}

impl From<figment::Error> for LinkError {
    fn from(value: figment::Error) -> Self {
        LinkError::Config(Box::new(value))
    }
}

impl LinkError {
    /// Builds a [`LinkError::Length`] for `packet`.
    pub fn length(packet: &'static str, expected: usize, actual: usize) -> Self {
        LinkError::Length {
            packet,
            expected,
            actual,
        }
    }

    /// Whether the error came from the user declining the device chooser.
    pub fn is_user_cancellation(&self) -> bool {
        matches!(self, LinkError::Transport(TransportError::UserCancelled))
    }
}
