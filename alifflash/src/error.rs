//! Error types for alifflash.
//!
//! Two kinds of failure exist in this crate and they are kept apart:
//!
//! - [`Error`] is returned through `Err` for contract violations (using a
//!   closed port, oversized frames) and for low-level I/O, parse and
//!   configuration failures raised by building blocks.
//! - [`FailureKind`] classifies *operational* outcomes (timeouts, rejected
//!   writes, USB drops). Public flashing operations report those inside
//!   their result structures and never through `Err`.

use std::{io, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Result type for alifflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for alifflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed JSON in a firmware table.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation was attempted on a link that is not open.
    #[error("Port {0} is not open")]
    PortNotOpen(String),

    /// A frame payload does not fit in the one-byte length field.
    #[error("Payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
        /// Largest payload a frame can carry.
        max: usize,
    },

    /// A binary referenced by the firmware table is missing.
    #[error("Image not found: {}", .0.display())]
    MissingImage(PathBuf),

    /// Board name not present in the registry.
    #[error("Unknown device '{name}'. Available: {available}")]
    UnknownBoard {
        /// Name that was looked up.
        name: String,
        /// Comma-separated list of known boards.
        available: String,
    },

    /// No usable serial port found.
    #[error("No SE-UART port found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Classification of an operational failure carried in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The link vanished or went silent mid-transfer (USB drop).
    Disconnected,
    /// The device answered with a code other than ACK/DATA.
    Rejected,
    /// The device never answered START_ISP.
    Unresponsive,
    /// The serial port could not be opened after all retries.
    PortUnavailable,
    /// Bad firmware table, missing binary or unknown board.
    Config,
    /// An external tool (J-Link, app-gen-toc) failed.
    Tool,
}
