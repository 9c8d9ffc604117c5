//! Port abstraction for the SE-UART link.
//!
//! The ISP pipeline never touches `serialport` directly. It talks to a
//! [`Connector`], which knows how to open endpoints, enumerate candidates and
//! wait, and to the [`Port`] values it hands out. The native implementation
//! lives in [`native`]; tests substitute an in-memory connector that scripts
//! device replies.
//!
//! ```text
//! +------------------------+
//! | Writer / Controller    |
//! +-----------+------------+
//!             |
//! +-----------v------------+
//! | IspLink (exchange)     |
//! +-----------+------------+
//!             |
//! +-----------v------------+      +-------------------+
//! | Connector + Port trait +----->| NativeConnector   |
//! +------------------------+      |   (serialport)    |
//!                                 +-------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "native")]
pub use native::{NativeConnector, NativePort};

use std::{
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    device::AdapterFilter,
    error::{Error, Result},
};

/// Baud rate of the SE-UART ISP link.
pub const ISP_BAUD: u32 = 57600;

/// Timeout applied when a port is first opened.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Open attempts for a port that should already be present.
pub const OPEN_RETRIES: u32 = 3;

/// Open attempts after the device has rebooted or dropped off USB.
pub const REOPEN_RETRIES: u32 = 5;

/// Delay between open attempts.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Settle time between opening a port and draining it.
const OPEN_SETTLE: Duration = Duration::from_millis(100);

/// Pause between drain reads while the line is still talking.
pub(crate) const DRAIN_PAUSE: Duration = Duration::from_millis(50);

/// Upper bound on drain reads for a line that never goes quiet.
const DRAIN_LIMIT: usize = 64;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/cu.usbserial-A50285BI", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default read/write timeout.
    pub timeout: Duration,
    /// Endpoints that count as ISP candidates when the port is rediscovered
    /// after a replug.
    pub adapters: AdapterFilter,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: ISP_BAUD,
            timeout: OPEN_TIMEOUT,
            adapters: AdapterFilter::default(),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Accept extra USB adapters during rediscovery.
    #[must_use]
    pub fn with_adapters(mut self, adapters: AdapterFilter) -> Self {
        self.adapters = adapters;
        self
    }

    /// Same settings, different endpoint.
    #[must_use]
    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// An open duplex byte channel.
pub trait Port: Read + Write + Send {
    /// Set the read timeout used by the next `read` call.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<u32>;

    /// Discard everything in the input buffer.
    fn clear_input(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Factory for [`Port`]s plus the host-side services around them.
///
/// Sleeping goes through the connector as well, so every settle delay of the
/// ISP pipeline can be observed (and skipped) by an in-memory connector.
pub trait Connector {
    /// Port type produced by [`Connector::open`].
    type Port: Port;

    /// Open a single port, without retries.
    fn open(&self, config: &SerialConfig) -> Result<Self::Port>;

    /// List all serial ports currently present.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Block the calling thread for `duration`.
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Read up to `len` bytes, giving up once `timeout` has elapsed.
///
/// The deadline is fixed when the call starts. Short reads, timeouts and I/O
/// errors all end the read and return whatever arrived so far.
pub fn read_with_deadline<P: Port + ?Sized>(port: &mut P, len: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || port.set_timeout(remaining).is_err() {
            break;
        }
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => {
                if e.kind() != ErrorKind::TimedOut {
                    trace!("read on {} failed: {e}", port.name());
                }
                break;
            },
        }
    }

    buf.truncate(filled);
    buf
}

/// Read and discard whatever is currently buffered. Returns the byte count.
pub fn discard_pending<P: Port + ?Sized>(port: &mut P) -> Result<usize> {
    let waiting = port.bytes_to_read()? as usize;
    if waiting == 0 {
        return Ok(0);
    }
    let mut scratch = vec![0u8; waiting];
    let n = port.read(&mut scratch)?;
    Ok(n)
}

/// Discard stale input until the line is quiet. Returns the byte count.
pub fn drain_stale<C: Connector>(connector: &C, port: &mut C::Port) -> Result<usize> {
    let mut total = 0;
    for _ in 0..DRAIN_LIMIT {
        let n = discard_pending(port)?;
        if n == 0 {
            break;
        }
        total += n;
        connector.pause(DRAIN_PAUSE);
    }
    if total > 0 {
        debug!("Drained {total} stale bytes from {}", port.name());
    }
    Ok(total)
}

/// Open `config.port_name`, retrying while the device re-enumerates.
///
/// Each attempt opens the port, waits briefly and drains stale input. A port
/// that opens but cannot be drained counts as a failed attempt. The last
/// error is returned once all `retries` attempts are used up.
pub fn open_with_retry<C: Connector>(
    connector: &C,
    config: &SerialConfig,
    retries: u32,
    retry_delay: Duration,
) -> Result<C::Port> {
    let retries = retries.max(1);

    for attempt in 1..=retries {
        let result = connector
            .open(config)
            .and_then(|mut port| {
                connector.pause(OPEN_SETTLE);
                match drain_stale(connector, &mut port) {
                    Ok(_) => Ok(port),
                    Err(e) => {
                        let _ = port.close();
                        Err(e)
                    },
                }
            });

        match result {
            Ok(port) => return Ok(port),
            Err(e) if attempt < retries => {
                warn!(
                    "Failed to open {} (attempt {attempt}/{retries}): {e}",
                    config.port_name
                );
                connector.pause(retry_delay);
            },
            Err(e) => return Err(e),
        }
    }

    Err(Error::DeviceNotFound)
}
