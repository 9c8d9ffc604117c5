//! Alif Ensemble SE-UART ISP pipeline.
//!
//! Layers, bottom up:
//!
//! - [`link`]: one request/response exchange at a time over a reopenable port
//! - [`maintenance`]: the flag-and-reboot cycle that unlocks MRAM writes
//! - [`writer`]: segmented image writes with USB-drop recovery
//! - [`flasher`]: maintenance, ATOC package, components, final reset
//! - [`probe`]: read-only liveness check

pub mod flasher;
pub mod link;
pub mod maintenance;
pub mod probe;
pub mod writer;

pub use flasher::{FlashReport, flash_images, flash_resolved};
pub use link::{Exchange, IspLink, IspStart};
pub use maintenance::{EntryStrategy, MaintenanceReport, SessionState, enter_maintenance};
pub use probe::{ProbeReport, probe};
pub use writer::{ProgressFn, TransferReport, write_image, write_image_on};
