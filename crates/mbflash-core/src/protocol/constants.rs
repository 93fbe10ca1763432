//! Register protocol constants shared by the built-in revisions.

// ============================================================================
// Function Codes
// ============================================================================

pub const FCODE_READ_HOLDING_REGISTERS: u8 = 3;
pub const FCODE_WRITE_REGISTER: u8 = 6;
pub const FCODE_WRITE_MULTI_REGISTER: u8 = 16;
/// Vendor extension: read raw bytes from the register space.
pub const FCODE_READ_BYTES: u8 = 65;
/// Vendor extension: write raw bytes to the register space.
pub const FCODE_WRITE_BYTES: u8 = 66;

// ============================================================================
// Register Layout
// ============================================================================

/// Start of the bootloader's register window.
pub const RTU_ADDR_BASE: u16 = 0x2000;

/// Control/flag byte.
pub const CONTROL_OFFSET: u16 = 0;

/// Page base-address field (u16).
pub const PAGE_ADDRESS_OFFSET: u16 = 3;

/// Page payload buffer.
pub const PAGE_DATA_OFFSET: u16 = 5;

// ============================================================================
// Control Flags
// ============================================================================

pub const FLAG_FLASH_PAGE_UPDATE: u8 = 0x01;
pub const FLAG_FLASH_PAGE_RNW: u8 = 0x02;
pub const FLAG_EEPROM_UPDATE: u8 = 0x04;
pub const FLAG_EEPROM_RNW: u8 = 0x08;
pub const FLAG_WATCHDOG_DISABLE: u8 = 0x10;
pub const FLAG_WATCHDOG_RESET: u8 = 0x20;
pub const FLAG_REBOOT: u8 = 0x80;

// ============================================================================
// Timing
// ============================================================================

/// Timeout attached to page payload writes; programming a page is slow.
pub const PAGE_WRITE_TIMEOUT_MS: u32 = 1000;

/// Pause between pages used by the legacy revision.
pub const LEGACY_INTER_PAGE_DELAY_MS: u64 = 250;

/// Status element the broker prepends to successful replies.
pub const DEFAULT_STATUS_SUCCESS: &str = "OK";
