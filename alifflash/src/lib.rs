//! # alifflash
//!
//! SE-UART In-System-Programming client for Alif Ensemble devices.
//!
//! This crate talks to the Secure Enclave over its ISP UART and writes
//! firmware into MRAM:
//!
//! - ISP frame codec with checksum (`[len, cmd, payload.., checksum]`)
//! - Maintenance-mode entry (flag, reset, verify)
//! - Segmented image writes that survive USB drops
//! - ATOC firmware-table resolution and whole-board flashing
//! - Debug-probe reset and `app-gen-toc` helpers
//! - Console capture after boot
//!
//! ## Supported Boards
//!
//! - Ensemble E7 AppKit (`alif-e7`, default)
//! - Ensemble E8 DevKit (`alif-e8`)
//!
//! ## Features
//!
//! - `native` (default): real serial ports via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use alifflash::{Board, FirmwareTable, NativeConnector, SerialConfig};
//! use alifflash::target::ensemble::{EntryStrategy, flash_images};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let board = Board::from_name("alif-e7")?;
//!     let layout = board.layout();
//!     let config = SerialConfig::new("/dev/cu.usbserial-A50285BI", layout.isp_baud);
//!     let table = FirmwareTable::from_file("build/config/linux-boot-e7.json")?;
//!
//!     let report = flash_images(
//!         &NativeConnector,
//!         &config,
//!         &table,
//!         &layout,
//!         Some(EntryStrategy::AlreadyBooted),
//!         &mut |name, done, total| println!("{name}: {done}/{total}"),
//!     )?;
//!     println!("{}", report.message);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod target;
pub mod tools;

// Native-specific re-exports
#[cfg(feature = "native")]
pub use host::{auto_detect_port, discover_isp_ports, discover_ports};
#[cfg(feature = "native")]
pub use port::{NativeConnector, NativePort};
pub use {
    device::{
        AdapterFilter, DetectedPort, DeviceKind, UsbId, enumerate_candidates, format_port_list,
        preferred_port,
    },
    error::{Error, FailureKind, Result},
    host::await_replug,
    image::{ImageDescriptor, firmware_table::FirmwareTable},
    monitor::{MonitorReport, capture},
    port::{Connector, Port, PortInfo, SerialConfig},
    protocol::isp::{CommandId, IspFrame, Response},
    target::{
        board::{Board, MramLayout},
        ensemble::{
            EntryStrategy, FlashReport, MaintenanceReport, ProbeReport, SessionState, TransferReport,
            enter_maintenance, flash_images, flash_resolved, probe, write_image,
        },
    },
    tools::{JLinkReset, TargetReset, ToolReport, generate_toc},
};
