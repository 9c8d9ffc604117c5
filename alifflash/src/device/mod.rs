//! SE-UART adapter discovery and classification.
//!
//! Alif boards expose the Secure Enclave UART through one of two USB bridges:
//! the FTDI chip on the PRG_USB connector (`cu.usbserial*` on macOS) or the
//! SEGGER J-Link virtual COM port (`cu.usbmodem*`). Both are ISP candidates;
//! FTDI is preferred when both are present.

use log::{debug, trace};

use crate::port::{Connector, PortInfo};

/// Known USB bridge kinds that can carry the SE-UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    /// FTDI FT232/FT2232/FT4232 bridge on PRG_USB.
    Ftdi,
    /// SEGGER J-Link virtual COM port.
    JLinkVcom,
    /// Anything else.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x1366, &[], DeviceKind::JLinkVcom),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Classify by the macOS device node naming convention.
    #[must_use]
    pub fn from_port_name(name: &str) -> Self {
        if name.contains("usbserial") {
            Self::Ftdi
        } else if name.contains("usbmodem") {
            Self::JLinkVcom
        } else {
            Self::Unknown
        }
    }

    /// Classify an enumerated port: USB IDs first, then the node name.
    #[must_use]
    pub fn classify(info: &PortInfo) -> Self {
        match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => match Self::from_vid_pid(vid, pid) {
                Self::Unknown => Self::from_port_name(&info.name),
                kind => kind,
            },
            _ => Self::from_port_name(&info.name),
        }
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ftdi => "FTDI",
            Self::JLinkVcom => "J-Link VCOM",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this kind can carry the SE-UART.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/cu.usbserial-A50285BI" or "COM3").
    pub name: String,
    /// Classified adapter kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = DeviceKind::classify(&info);
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

impl DetectedPort {
    /// Whether this endpoint is worth trying for ISP.
    pub fn is_isp_candidate(&self) -> bool {
        self.device.is_known()
    }
}

/// A USB vendor/product ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

/// Decides which endpoints count as ISP candidates.
///
/// The known bridge kinds always qualify. Extra VID/PID pairs (for boards
/// wired through some other USB-UART) can be added on top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterFilter {
    extra: Vec<UsbId>,
}

impl AdapterFilter {
    /// Known kinds plus `extra`.
    pub fn new(extra: impl IntoIterator<Item = UsbId>) -> Self {
        Self {
            extra: extra
                .into_iter()
                .collect(),
        }
    }

    /// Whether `vid:pid` is one of the extra adapters.
    pub fn is_extra(&self, vid: Option<u16>, pid: Option<u16>) -> bool {
        match (vid, pid) {
            (Some(vid), Some(pid)) => self
                .extra
                .contains(&UsbId { vid, pid }),
            _ => false,
        }
    }

    /// Whether `port` should be offered for ISP.
    pub fn accepts(&self, port: &DetectedPort) -> bool {
        port.is_isp_candidate() || self.is_extra(port.vid, port.pid)
    }
}

/// macOS lists every USB serial device twice; keep only the callout node.
fn is_macos_duplicate(name: &str, all: &[PortInfo]) -> bool {
    name.strip_prefix("/dev/tty.")
        .is_some_and(|rest| {
            all.iter()
                .any(|p| p.name == format!("/dev/cu.{rest}"))
        })
}

/// All endpoints the connector can see, sorted by name.
pub fn detect_ports<C: Connector>(connector: &C) -> Vec<DetectedPort> {
    let infos = match connector.list_ports() {
        Ok(infos) => infos,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    let mut ports: Vec<DetectedPort> = infos
        .iter()
        .filter(|info| !is_macos_duplicate(&info.name, &infos))
        .cloned()
        .map(DetectedPort::from)
        .inspect(|port| trace!("Found port {} ({})", port.name, port.device.name()))
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

/// ISP-capable endpoints, sorted by name.
pub fn isp_ports<C: Connector>(connector: &C) -> Vec<DetectedPort> {
    detect_ports(connector)
        .into_iter()
        .filter(DetectedPort::is_isp_candidate)
        .collect()
}

/// Names of endpoints `adapters` accepts, sorted deterministically.
pub fn enumerate_candidates<C: Connector>(connector: &C, adapters: &AdapterFilter) -> Vec<String> {
    detect_ports(connector)
        .into_iter()
        .filter(|p| adapters.accepts(p))
        .map(|p| p.name)
        .collect()
}

/// Pick the SE-UART: FTDI before J-Link VCOM, then by name.
pub fn preferred_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .filter(|p| p.is_isp_candidate())
        .min_by(|a, b| {
            a.device
                .cmp(&b.device)
                .then_with(|| a.name.cmp(&b.name))
        })
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}
