//! Serial console capture.
//!
//! After flashing, the A32 boot log comes out on a separate console UART.
//! [`capture`] records it for a fixed duration, decoding as UTF-8 on the fly.

use std::{
    io::{ErrorKind, Read},
    time::{Duration, Instant},
};

use log::{debug, info};
use serde::Serialize;

use crate::{
    error::{FailureKind, Result},
    host::{REPLUG_DISAPPEAR_TIMEOUT, REPLUG_TOTAL_TIMEOUT, await_replug},
    port::{Connector, Port, SerialConfig, drain_stale},
};

/// Default console baud rate.
pub const CONSOLE_BAUD: u32 = 115_200;

/// Default capture duration.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(15);

/// Upper bound on a single blocking read.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Outcome of [`capture`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    /// The console was opened and read.
    pub success: bool,
    /// Endpoint read from.
    pub port: String,
    /// Baud rate used.
    pub baud: u32,
    /// Raw bytes received.
    pub bytes: usize,
    /// Time actually spent reading.
    pub duration_seconds: f64,
    /// Captured text with control characters removed.
    pub output: String,
    /// Failure classification, `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Empty on success.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('\u{FFFD}');
                        let drain_to = valid_up_to
                            .saturating_add(invalid_len)
                            .min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Normalize line endings to `\n` and drop control characters other than
/// newline and tab.
pub fn clean_console_text(text: &str) -> String {
    let normalized = text
        .replace("\r\n", "\n")
        .replace('\r', "\n");
    normalized
        .chars()
        .filter(|&ch| matches!(ch, '\n' | '\t') || !ch.is_control())
        .collect()
}

/// Record console output from `config.port_name` for `duration`.
///
/// With `wait_replug`, first waits for the operator to power-cycle the
/// board and reads from whichever port comes back. Each decoded piece of
/// text is handed to `on_text` as it arrives.
pub fn capture<C: Connector>(
    connector: &C,
    config: &SerialConfig,
    duration: Duration,
    wait_replug: bool,
    on_text: &mut dyn FnMut(&str),
) -> Result<MonitorReport> {
    let mut report = MonitorReport {
        success: false,
        port: config.port_name.clone(),
        baud: config.baud_rate,
        bytes: 0,
        duration_seconds: 0.0,
        output: String::new(),
        failure: None,
        message: String::new(),
    };

    if wait_replug {
        let replugged = await_replug(
            connector,
            &config.adapters,
            REPLUG_DISAPPEAR_TIMEOUT,
            REPLUG_TOTAL_TIMEOUT,
        );
        match replugged {
            Some(port) => report.port = port,
            None => {
                report.failure = Some(FailureKind::PortUnavailable);
                report.message = "Timed out waiting for port to reappear".to_string();
                return Ok(report);
            },
        }
    }

    let config = config
        .clone()
        .with_port_name(&report.port);
    let mut port = match connector.open(&config) {
        Ok(port) => port,
        Err(e) => {
            report.failure = Some(FailureKind::PortUnavailable);
            report.message = format!("Failed to open {}: {e}", report.port);
            return Ok(report);
        },
    };
    if let Err(e) = drain_stale(connector, &mut port) {
        let _ = port.close();
        report.failure = Some(FailureKind::PortUnavailable);
        report.message = format!("{} stopped responding: {e}", report.port);
        return Ok(report);
    }
    info!("Capturing {} at {} baud for {}s", report.port, report.baud, duration.as_secs_f64());

    let started = Instant::now();
    let mut pending = Vec::new();
    let mut text = String::new();
    let mut buf = [0u8; 1024];
    let mut lost = None;
    loop {
        let remaining = duration.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        if let Err(e) = port.set_timeout(remaining.min(READ_SLICE)) {
            lost = Some(e);
            break;
        }
        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                report.bytes += n;
                pending.extend_from_slice(&buf[..n]);
                let piece = drain_utf8_lossy(&mut pending);
                if !piece.is_empty() {
                    on_text(&piece);
                    text.push_str(&piece);
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
            Err(e) => {
                debug!("console read ended: {e}");
                break;
            },
        }
    }
    if !pending.is_empty() {
        text.push_str(&String::from_utf8_lossy(&pending));
    }
    let _ = port.close();

    report.duration_seconds = (started
        .elapsed()
        .as_secs_f64()
        * 10.0)
        .round()
        / 10.0;
    report.output = clean_console_text(&text);
    match lost {
        Some(e) => {
            report.failure = Some(FailureKind::PortUnavailable);
            report.message = format!("{} stopped responding: {e}", report.port);
        },
        None => report.success = true,
    }
    Ok(report)
}
