//! ATOC firmware table (the SE tools JSON config).
//!
//! The config maps component names to `{binary, mramAddress, disabled}`
//! objects and lives in `<build>/config/`. Binaries are looked up in
//! `<build>/images/` and the generated table-of-contents package in
//! `<build>/AppTocPackage.bin`.
//!
//! ```json
//! {
//!     "DEVICE": { "partNumber": "AE722F80F55D5LS" },
//!     "TFA":    { "binary": "bl32.bin",   "mramAddress": "0x80002000" },
//!     "KERNEL": { "binary": "xipImage",   "mramAddress": "0x80020000" },
//!     "ROOTFS": { "binary": "cramfs.img", "mramAddress": "0x80300000", "disabled": true }
//! }
//! ```

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{Error, Result},
    image::ImageDescriptor,
    target::board::MramLayout,
};

/// File name of the generated table-of-contents package.
pub const TOC_PACKAGE: &str = "AppTocPackage.bin";

/// Key holding device metadata rather than an image.
const DEVICE_KEY: &str = "DEVICE";

/// One validated component of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareEntry {
    /// Component key, e.g. `KERNEL`.
    pub name: String,
    /// Binary file name relative to the images directory.
    pub binary: String,
    /// Destination MRAM address.
    pub address: u32,
    /// `false` when the entry is marked `disabled`.
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    binary: Option<String>,
    mram_address: Option<Value>,
    #[serde(default)]
    disabled: bool,
}

/// Parsed and validated firmware table.
#[derive(Debug, Clone)]
pub struct FirmwareTable {
    path: PathBuf,
    entries: Vec<FirmwareEntry>,
}

/// Parse `"0x80002000"`, `"80002000"` or a JSON integer.
pub fn parse_address(value: &Value) -> Option<u32> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s)
                .replace('_', "");
            u32::from_str_radix(&digits, 16).ok()
        },
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok()),
        _ => None,
    }
}

fn validate_entry(name: &str, value: &Value) -> Result<FirmwareEntry> {
    let raw: RawEntry = serde_json::from_value(value.clone())
        .map_err(|e| Error::Config(format!("entry '{name}': {e}")))?;

    if raw.disabled {
        return Ok(FirmwareEntry {
            name: name.to_string(),
            binary: raw
                .binary
                .unwrap_or_default(),
            address: raw
                .mram_address
                .as_ref()
                .and_then(parse_address)
                .unwrap_or_default(),
            enabled: false,
        });
    }

    let binary = raw
        .binary
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("entry '{name}' has no binary")))?;
    if Path::new(&binary)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::Config(format!(
            "entry '{name}': binary '{binary}' must be a plain file name inside images/"
        )));
    }

    let address = match raw.mram_address {
        Some(value) => parse_address(&value).ok_or_else(|| {
            Error::Config(format!("entry '{name}' has invalid mramAddress {value}"))
        })?,
        None => return Err(Error::Config(format!("entry '{name}' has no mramAddress"))),
    };

    Ok(FirmwareEntry {
        name: name.to_string(),
        binary,
        address,
        enabled: true,
    })
}

impl FirmwareTable {
    /// Read and validate a table from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(path, &text)
    }

    /// Validate a table from JSON text; `path` anchors the build directory.
    pub fn parse(path: impl Into<PathBuf>, json: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(json)?;
        let Value::Object(map) = root else {
            return Err(Error::Config("ATOC config must be a JSON object".to_string()));
        };

        let mut entries = Vec::new();
        for (name, value) in &map {
            if name == DEVICE_KEY || !value.is_object() {
                continue;
            }
            entries.push(validate_entry(name, value)?);
        }

        Ok(Self {
            path: path.into(),
            entries,
        })
    }

    /// Path the table was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, disabled ones included.
    pub fn entries(&self) -> &[FirmwareEntry] {
        &self.entries
    }

    /// Entries that will be flashed.
    pub fn enabled(&self) -> impl Iterator<Item = &FirmwareEntry> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
    }

    /// Build directory: the parent of the config's directory.
    pub fn build_dir(&self) -> PathBuf {
        let config_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        match config_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => config_dir.join(".."),
        }
    }

    /// Directory holding the component binaries.
    pub fn images_dir(&self) -> PathBuf {
        self.build_dir()
            .join("images")
    }

    /// Expected location of the table-of-contents package.
    pub fn toc_path(&self) -> PathBuf {
        self.build_dir()
            .join(TOC_PACKAGE)
    }

    /// Load every binary into an ordered image list: TOC first, then
    /// components by address.
    ///
    /// Fails without touching the device if any binary is missing, the
    /// images overlap, or nothing is left to flash.
    pub fn resolve(&self, layout: &MramLayout) -> Result<Vec<ImageDescriptor>> {
        let mut images = Vec::new();

        let toc_path = self.toc_path();
        if toc_path.is_file() {
            let data = fs::read(&toc_path)?;
            let address = u32::try_from(data.len())
                .ok()
                .and_then(|len| {
                    layout
                        .system_mram_base
                        .checked_sub(len)
                })
                .ok_or_else(|| Error::Config(format!("{TOC_PACKAGE} is too large")))?;
            info!("ATOC: {} bytes -> 0x{address:08X}", data.len());
            images.push(ImageDescriptor::new(TOC_PACKAGE, address, data)?);
        } else {
            warn!(
                "{TOC_PACKAGE} not found at {}, run gen-toc first",
                toc_path.display()
            );
        }

        let images_dir = self.images_dir();
        let mut components = Vec::new();
        for entry in self.enabled() {
            let path = images_dir.join(&entry.binary);
            debug!("{}: {} -> 0x{:08X}", entry.name, path.display(), entry.address);
            components.push(ImageDescriptor::from_file(&path, entry.address)?);
        }
        components.sort_by_key(ImageDescriptor::address);
        images.extend(components);

        if images.is_empty() {
            return Err(Error::Config("No images found in config".to_string()));
        }

        let mut by_address: Vec<&ImageDescriptor> = images.iter().collect();
        by_address.sort_by_key(|i| i.address());
        for pair in by_address.windows(2) {
            let end = u64::from(pair[0].address()) + pair[0].padded_len() as u64;
            if end > u64::from(pair[1].address()) {
                return Err(Error::Config(format!(
                    "{} (0x{:08X}) overlaps {} (0x{:08X})",
                    pair[0].name(),
                    pair[0].address(),
                    pair[1].name(),
                    pair[1].address()
                )));
            }
        }

        Ok(images)
    }
}
