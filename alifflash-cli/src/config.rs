//! Configuration file support for alifflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ALIFFLASH_*)
//! 3. Local config file (./alifflash.toml)
//! 4. Global config file (~/.config/alifflash/config.toml)
//!
//! An explicit `--config` file replaces both files.

use alifflash::{AdapterFilter, UsbId};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name, looked up in the working directory.
pub const LOCAL_CONFIG: &str = "alifflash.toml";

/// USB adapter identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl From<&UsbDevice> for UsbId {
    fn from(device: &UsbDevice) -> Self {
        Self {
            vid: device.vid,
            pid: device.pid,
        }
    }
}

/// `[port]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred SE-UART endpoint (e.g., "/dev/cu.usbserial-A50285BI").
    pub serial: Option<String>,
    /// ISP baud rate override.
    pub baud: Option<u32>,
    /// Extra adapters to treat as ISP candidates.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// `[flash]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Board registry key.
    pub board: Option<String>,
    /// SE tools directory (holds `app-gen-toc` and `build/config`).
    pub setools_dir: Option<PathBuf>,
}

/// `[jlink]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JLinkConfig {
    /// Path to `JLinkExe`.
    pub exe: Option<PathBuf>,
    /// SWD speed in kHz.
    pub speed: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Debug probe configuration.
    #[serde(default)]
    pub jlink: JLinkConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        Self::load_layered(
            Self::global_config_path().as_deref(),
            Path::new(LOCAL_CONFIG),
        )
    }

    /// Merge `global` then `local`; either may be absent.
    fn load_layered(global: Option<&Path>, local: &Path) -> Self {
        let mut config = Self::default();

        if let Some(global_config) = global.and_then(Self::load_from_file) {
            debug!("Loaded global config");
            config.merge(global_config);
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(local) {
            debug!("Loaded local config from {}", local.display());
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "alifflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Built-in ISP adapters plus the `[[port.usb_device]]` entries.
    pub fn adapter_filter(&self) -> AdapterFilter {
        AdapterFilter::new(
            self.port
                .usb_device
                .iter()
                .map(UsbId::from),
        )
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        if other.flash.board.is_some() {
            self.flash.board = other.flash.board;
        }
        if other.flash.setools_dir.is_some() {
            self.flash.setools_dir = other.flash.setools_dir;
        }

        if other.jlink.exe.is_some() {
            self.jlink.exe = other.jlink.exe;
        }
        if other.jlink.speed.is_some() {
            self.jlink.speed = other.jlink.speed;
        }
    }
}
