//! Supported Alif Ensemble boards.
//!
//! The registry is a closed set. Looking up a name that is not listed fails
//! instead of falling back to a default layout.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    port::ISP_BAUD,
};

/// First byte above the application MRAM area. The ATOC package ends here.
pub const SYSTEM_MRAM_BASE: u32 = 0x8058_0000;

/// Supported boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Board {
    /// Ensemble E7 AppKit.
    #[default]
    AlifE7,
    /// Ensemble E8 DevKit.
    AlifE8,
}

/// Board parameters consumed by the flashing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MramLayout {
    /// SE-UART ISP baud rate.
    pub isp_baud: u32,
    /// Address the ATOC package must end at.
    pub system_mram_base: u32,
    /// Core the debug probe attaches to for a reset.
    pub reset_core: &'static str,
}

impl Board {
    /// Every board in the registry.
    pub const ALL: [Self; 2] = [Self::AlifE7, Self::AlifE8];

    /// Registry key.
    pub fn name(self) -> &'static str {
        match self {
            Self::AlifE7 => "alif-e7",
            Self::AlifE8 => "alif-e8",
        }
    }

    /// Marketing name.
    pub fn description(self) -> &'static str {
        match self {
            Self::AlifE7 => "Alif Ensemble E7 AppKit",
            Self::AlifE8 => "Alif Ensemble E8 DevKit",
        }
    }

    /// Look up a board by registry key (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name
            .trim()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|board| board.name() == wanted)
            .ok_or_else(|| Error::UnknownBoard {
                name: name.to_string(),
                available: Self::ALL
                    .iter()
                    .map(|b| b.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Flashing parameters for this board.
    pub fn layout(self) -> MramLayout {
        match self {
            Self::AlifE7 | Self::AlifE8 => MramLayout {
                isp_baud: ISP_BAUD,
                system_mram_base: SYSTEM_MRAM_BASE,
                reset_core: "Cortex-A32",
            },
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}
