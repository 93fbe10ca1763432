//! Protocol revisions as data.
//!
//! Bootloader revisions differ in register offsets, the width of the progress
//! counter, the byte order of the page address, the flag bitmasks, the reply
//! envelope and whether the watchdog must be fed. All of that lives in a
//! [`ProtocolRevision`] value; the codec and the session never branch on a
//! revision name.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::*;
use super::frame::FunctionCode;
use crate::page::DEFAULT_PAGE_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown protocol revision {0:?}")]
    UnknownRevision(String),

    #[error("progress counter width must be 1 or 2 bytes, got {0}")]
    ProgressWidth(u8),

    #[error("page size must be non-zero")]
    PageSize,

    #[error("{register} register offset 0x{offset:X} overflows base 0x{base:04X}")]
    RegisterOverflow {
        register: &'static str,
        base: u16,
        offset: u16,
    },

    #[error("{function} cannot be used to {role}")]
    FunctionRole {
        function: FunctionCode,
        role: &'static str,
    },

    #[error("flag catalogue lacks {0}")]
    MissingFlag(ControlFlag),
}

/// Byte order of multi-byte register fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

/// Bits of the control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlFlag {
    FlashPageUpdate,
    FlashPageRnw,
    EepromUpdate,
    EepromRnw,
    WatchdogDisable,
    WatchdogReset,
    Reboot,
}

impl fmt::Display for ControlFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlFlag::FlashPageUpdate => write!(f, "FLASH_PAGE_UPDATE"),
            ControlFlag::FlashPageRnw => write!(f, "FLASH_PAGE_RNW"),
            ControlFlag::EepromUpdate => write!(f, "EEPROM_UPDATE"),
            ControlFlag::EepromRnw => write!(f, "EEPROM_RNW"),
            ControlFlag::WatchdogDisable => write!(f, "WATCHDOG_DISABLE"),
            ControlFlag::WatchdogReset => write!(f, "WATCHDOG_RESET"),
            ControlFlag::Reboot => write!(f, "REBOOT"),
        }
    }
}

/// Bitmask catalogue of a revision. A missing entry means the revision has no
/// such flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlFlags {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_page_update: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_page_rnw: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eeprom_update: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eeprom_rnw: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_disable: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_reset: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot: Option<u8>,
}

impl ControlFlags {
    /// The catalogue shared by the known bootloaders.
    pub fn standard() -> Self {
        Self {
            flash_page_update: Some(FLAG_FLASH_PAGE_UPDATE),
            flash_page_rnw: Some(FLAG_FLASH_PAGE_RNW),
            eeprom_update: Some(FLAG_EEPROM_UPDATE),
            eeprom_rnw: Some(FLAG_EEPROM_RNW),
            watchdog_disable: Some(FLAG_WATCHDOG_DISABLE),
            watchdog_reset: Some(FLAG_WATCHDOG_RESET),
            reboot: Some(FLAG_REBOOT),
        }
    }

    pub fn mask(&self, flag: ControlFlag) -> Option<u8> {
        match flag {
            ControlFlag::FlashPageUpdate => self.flash_page_update,
            ControlFlag::FlashPageRnw => self.flash_page_rnw,
            ControlFlag::EepromUpdate => self.eeprom_update,
            ControlFlag::EepromRnw => self.eeprom_rnw,
            ControlFlag::WatchdogDisable => self.watchdog_disable,
            ControlFlag::WatchdogReset => self.watchdog_reset,
            ControlFlag::Reboot => self.reboot,
        }
    }

    /// Reverse lookup, used by the device emulator.
    pub fn flag_for(&self, mask: u8) -> Option<ControlFlag> {
        [
            ControlFlag::FlashPageUpdate,
            ControlFlag::FlashPageRnw,
            ControlFlag::EepromUpdate,
            ControlFlag::EepromRnw,
            ControlFlag::WatchdogDisable,
            ControlFlag::WatchdogReset,
            ControlFlag::Reboot,
        ]
        .into_iter()
        .find(|&flag| self.mask(flag) == Some(mask))
    }
}

/// Register layout of a bootloader revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMap {
    pub base: u16,
    pub control_offset: u16,
    pub progress_offset: u16,
    /// Width of the progress counter in bytes (1 or 2).
    pub progress_width: u8,
    pub page_address_offset: u16,
    pub page_address_order: Endianness,
    pub page_data_offset: u16,
    pub read_function: FunctionCode,
    pub write_function: FunctionCode,
    pub flags: ControlFlags,
}

impl RegisterMap {
    pub fn control_register(&self) -> u16 {
        self.base.wrapping_add(self.control_offset)
    }

    pub fn progress_register(&self) -> u16 {
        self.base.wrapping_add(self.progress_offset)
    }

    pub fn page_address_register(&self) -> u16 {
        self.base.wrapping_add(self.page_address_offset)
    }

    pub fn page_data_register(&self) -> u16 {
        self.base.wrapping_add(self.page_data_offset)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=2).contains(&self.progress_width) {
            return Err(ConfigError::ProgressWidth(self.progress_width));
        }
        for (register, offset) in [
            ("control", self.control_offset),
            ("progress", self.progress_offset),
            ("page address", self.page_address_offset),
            ("page data", self.page_data_offset),
        ] {
            if self.base.checked_add(offset).is_none() {
                return Err(ConfigError::RegisterOverflow {
                    register,
                    base: self.base,
                    offset,
                });
            }
        }
        if !self.read_function.is_read() {
            return Err(ConfigError::FunctionRole {
                function: self.read_function,
                role: "read the progress counter",
            });
        }
        if self.write_function.is_read() {
            return Err(ConfigError::FunctionRole {
                function: self.write_function,
                role: "write registers",
            });
        }
        for flag in [ControlFlag::FlashPageUpdate, ControlFlag::Reboot] {
            if self.flags.mask(flag).is_none() {
                return Err(ConfigError::MissingFlag(flag));
            }
        }
        Ok(())
    }
}

/// Shape of the reply payload list returned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReplyConvention {
    /// `[json]`
    Bare,
    /// `[status, json]`; `status` must equal `success`.
    StatusPrefixed { success: String },
}

/// Everything that distinguishes one bootloader protocol revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRevision {
    pub name: String,
    /// Feed the watchdog before every page write.
    pub watchdog_reset: bool,
    #[serde(default)]
    pub inter_page_delay_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u16,
    #[serde(default = "default_page_write_timeout")]
    pub page_write_timeout_ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_timeout_ms: Option<u32>,
    // Tables last so the TOML form stays valid.
    pub register_map: RegisterMap,
    pub reply: ReplyConvention,
}

fn default_page_size() -> u16 {
    DEFAULT_PAGE_SIZE
}

fn default_page_write_timeout() -> u32 {
    PAGE_WRITE_TIMEOUT_MS
}

impl ProtocolRevision {
    /// Names accepted by [`ProtocolRevision::builtin`].
    pub const BUILTIN: &'static [&'static str] = &["v1", "v2"];

    /// Legacy bootloader: 16-bit counter, big-endian page address, bare
    /// replies, no watchdog feeding, paced pages.
    pub fn v1() -> Self {
        Self {
            name: "v1".to_string(),
            register_map: RegisterMap {
                base: RTU_ADDR_BASE,
                control_offset: CONTROL_OFFSET,
                progress_offset: 1,
                progress_width: 2,
                page_address_offset: PAGE_ADDRESS_OFFSET,
                page_address_order: Endianness::Big,
                page_data_offset: PAGE_DATA_OFFSET,
                read_function: FunctionCode::ReadBytes,
                write_function: FunctionCode::WriteBytes,
                flags: ControlFlags::standard(),
            },
            reply: ReplyConvention::Bare,
            watchdog_reset: false,
            inter_page_delay_ms: LEGACY_INTER_PAGE_DELAY_MS,
            page_size: DEFAULT_PAGE_SIZE,
            page_write_timeout_ms: PAGE_WRITE_TIMEOUT_MS,
            control_timeout_ms: None,
        }
    }

    /// Current bootloader: 8-bit counter, little-endian page address,
    /// status-prefixed replies, watchdog fed before each page.
    pub fn v2() -> Self {
        Self {
            name: "v2".to_string(),
            register_map: RegisterMap {
                base: RTU_ADDR_BASE,
                control_offset: CONTROL_OFFSET,
                progress_offset: 2,
                progress_width: 1,
                page_address_offset: PAGE_ADDRESS_OFFSET,
                page_address_order: Endianness::Little,
                page_data_offset: PAGE_DATA_OFFSET,
                read_function: FunctionCode::ReadBytes,
                write_function: FunctionCode::WriteBytes,
                flags: ControlFlags::standard(),
            },
            reply: ReplyConvention::StatusPrefixed {
                success: DEFAULT_STATUS_SUCCESS.to_string(),
            },
            watchdog_reset: true,
            inter_page_delay_ms: 0,
            page_size: DEFAULT_PAGE_SIZE,
            page_write_timeout_ms: PAGE_WRITE_TIMEOUT_MS,
            control_timeout_ms: None,
        }
    }

    pub fn builtin(name: &str) -> Result<Self, ConfigError> {
        match name {
            "v1" => Ok(Self::v1()),
            "v2" => Ok(Self::v2()),
            other => Err(ConfigError::UnknownRevision(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.register_map.validate()?;
        if self.page_size == 0 {
            return Err(ConfigError::PageSize);
        }
        if self.watchdog_reset && self.register_map.flags.watchdog_reset.is_none() {
            return Err(ConfigError::MissingFlag(ControlFlag::WatchdogReset));
        }
        Ok(())
    }

    pub fn inter_page_delay(&self) -> Duration {
        Duration::from_millis(self.inter_page_delay_ms)
    }

    /// Load a revision from a TOML file and validate it.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let revision: ProtocolRevision = toml::from_str(&content)?;
        revision.validate()?;
        Ok(revision)
    }

    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for ProtocolRevision {
    fn default() -> Self {
        Self::v2()
    }
}
