//! Host-side port discovery and replug detection.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{
    device::{AdapterFilter, DetectedPort, enumerate_candidates},
    port::Connector,
};

/// How long an operator has to unplug PRG_USB.
pub const REPLUG_DISAPPEAR_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall budget for unplug plus replug.
pub const REPLUG_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

const REPLUG_POLL: Duration = Duration::from_millis(300);

/// Let the USB stack finish enumerating a port that just reappeared.
const REPLUG_SETTLE: Duration = Duration::from_millis(500);

/// Wait for the operator to power-cycle the board over USB.
///
/// First waits for every candidate `adapters` accepts to disappear, then for
/// one to come back, and returns the first candidate seen after the settle
/// delay. Returns `None` if either phase runs out of time.
pub fn await_replug<C: Connector>(
    connector: &C,
    adapters: &AdapterFilter,
    disappear_timeout: Duration,
    total_timeout: Duration,
) -> Option<String> {
    let start = Instant::now();

    info!("Waiting for PRG_USB unplug...");
    loop {
        if enumerate_candidates(connector, adapters).is_empty() {
            break;
        }
        if start.elapsed() >= disappear_timeout {
            warn!("Port never disappeared within {}s", disappear_timeout.as_secs());
            return None;
        }
        connector.pause(REPLUG_POLL);
    }
    debug!("SE-UART gone after {:.1}s", start.elapsed().as_secs_f64());

    info!("Waiting for PRG_USB replug...");
    loop {
        if !enumerate_candidates(connector, adapters).is_empty() {
            connector.pause(REPLUG_SETTLE);
            let port = enumerate_candidates(connector, adapters)
                .into_iter()
                .next();
            if let Some(ref name) = port {
                info!("Port reappeared: {name}");
            }
            return port;
        }
        if start.elapsed() >= total_timeout {
            warn!("Port did not reappear within {}s", total_timeout.as_secs());
            return None;
        }
        connector.pause(REPLUG_POLL);
    }
}

/// Discover all available serial ports.
#[cfg(feature = "native")]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports(&crate::port::NativeConnector)
}

/// Discover serial ports that can carry the SE-UART.
#[cfg(feature = "native")]
#[must_use]
pub fn discover_isp_ports() -> Vec<DetectedPort> {
    crate::device::isp_ports(&crate::port::NativeConnector)
}

/// Auto-detect the preferred SE-UART port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> crate::Result<DetectedPort> {
    let ports = discover_isp_ports();
    crate::device::preferred_port(&ports)
        .cloned()
        .inspect(|port| info!("Auto-detected {} port: {}", port.device.name(), port.name))
        .ok_or(crate::Error::DeviceNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::UsbId,
        port::{
            PortInfo,
            mock::{MockConnector, ftdi_port},
        },
    };

    #[test]
    fn test_await_replug_returns_reappeared_port() {
        let connector = MockConnector::silent().with_port_lists(vec![
            vec![ftdi_port("/dev/cu.usbserial-OLD")],
            vec![ftdi_port("/dev/cu.usbserial-OLD")],
            vec![],
            vec![],
            vec![ftdi_port("/dev/cu.usbserial-NEW")],
        ]);

        let port = await_replug(
            &connector,
            &AdapterFilter::default(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert_eq!(port.as_deref(), Some("/dev/cu.usbserial-NEW"));
        assert!(connector.pauses().contains(&REPLUG_SETTLE));
    }

    #[test]
    fn test_await_replug_times_out_when_never_unplugged() {
        let connector =
            MockConnector::silent().with_port_lists(vec![vec![ftdi_port("/dev/cu.usbserial-A")]]);

        let port = await_replug(
            &connector,
            &AdapterFilter::default(),
            Duration::from_millis(20),
            Duration::from_millis(40),
        );
        assert_eq!(port, None);
    }

    #[test]
    fn test_await_replug_times_out_when_never_replugged() {
        let connector = MockConnector::silent().with_port_lists(vec![vec![]]);

        let port = await_replug(
            &connector,
            &AdapterFilter::default(),
            Duration::from_millis(20),
            Duration::from_millis(40),
        );
        assert_eq!(port, None);
    }

    #[test]
    fn test_await_replug_follows_configured_adapter() {
        let cp2102 = |name: &str| PortInfo {
            name: name.to_string(),
            vid: Some(0x10C4),
            pid: Some(0xEA60),
            ..PortInfo::default()
        };
        let connector = MockConnector::silent().with_port_lists(vec![
            vec![cp2102("/dev/ttyUSB0")],
            vec![],
            vec![cp2102("/dev/ttyUSB1")],
        ]);
        let adapters = AdapterFilter::new([UsbId {
            vid: 0x10C4,
            pid: 0xEA60,
        }]);

        let port =
            await_replug(&connector, &adapters, Duration::from_secs(5), Duration::from_secs(10));
        assert_eq!(port.as_deref(), Some("/dev/ttyUSB1"));
    }
}
