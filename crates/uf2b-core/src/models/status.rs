//! Per-port status codes reported by the controller board

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of USB ports driven by the controller board
pub const DEVICE_CAPACITY: usize = 64;

/// Mask selecting the lifecycle ordinal (low 5 bits)
pub const ORDINAL_MASK: u8 = 0x1f;

/// Error bit; when set the ordinal names a failure
pub const ERROR_FLAG: u8 = 0x10;

/// USB host stack has enumerated the device
pub const TUH_MOUNTED: u8 = 0x20;
/// Mass-storage interface is mounted
pub const MSC_MOUNTED: u8 = 0x40;
/// Serial (CDC) interface is mounted
pub const CDC_MOUNTED: u8 = 0x80;
/// Any of the mount flags
pub const MOUNT_FLAGS: u8 = TUH_MOUNTED | MSC_MOUNTED | CDC_MOUNTED;

/// Lifecycle and failure states encoded in the low 5 bits of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceState {
    Unknown = 0x00,
    Selected = 0x01,
    BootselRequest = 0x02,
    BootselComplete = 0x03,
    FlashDiskInit = 0x04,
    FlashDiskReadBusy = 0x05,
    FlashDiskWriteBusy = 0x06,
    FlashDiskIoComplete = 0x07,
    FlashRequest = 0x08,
    FlashComplete = 0x09,

    ErrorBootselMiss = 0x10,
    ErrorFlashInquiry = 0x11,
    ErrorFlashMount = 0x12,
    ErrorFlashOpen = 0x13,
    ErrorFlashWrite = 0x14,
    ErrorFlashClose = 0x15,
    Disconnected = 0x16,
}

impl DeviceState {
    /// Look up a state from its 5-bit ordinal
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        let state = match ordinal {
            0x00 => Self::Unknown,
            0x01 => Self::Selected,
            0x02 => Self::BootselRequest,
            0x03 => Self::BootselComplete,
            0x04 => Self::FlashDiskInit,
            0x05 => Self::FlashDiskReadBusy,
            0x06 => Self::FlashDiskWriteBusy,
            0x07 => Self::FlashDiskIoComplete,
            0x08 => Self::FlashRequest,
            0x09 => Self::FlashComplete,
            0x10 => Self::ErrorBootselMiss,
            0x11 => Self::ErrorFlashInquiry,
            0x12 => Self::ErrorFlashMount,
            0x13 => Self::ErrorFlashOpen,
            0x14 => Self::ErrorFlashWrite,
            0x15 => Self::ErrorFlashClose,
            0x16 => Self::Disconnected,
            _ => return None,
        };
        Some(state)
    }

    /// The 5-bit ordinal of this state
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether this state carries the error bit
    pub fn is_error(self) -> bool {
        self.ordinal() & ERROR_FLAG != 0
    }

    /// Name used by the controller firmware, for diagnostics only
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "DEVICE_UNKNOWN",
            Self::Selected => "DEVICE_SELECTED",
            Self::BootselRequest => "DEVICE_BOOTSEL_REQUEST",
            Self::BootselComplete => "DEVICE_BOOTSEL_COMPLETE",
            Self::FlashDiskInit => "DEVICE_FLASH_DISK_INIT",
            Self::FlashDiskReadBusy => "DEVICE_FLASH_DISK_READ_BUSY",
            Self::FlashDiskWriteBusy => "DEVICE_FLASH_DISK_WRITE_BUSY",
            Self::FlashDiskIoComplete => "DEVICE_FLASH_DISK_IO_COMPLETE",
            Self::FlashRequest => "DEVICE_FLASH_REQUEST",
            Self::FlashComplete => "DEVICE_FLASH_COMPLETE",
            Self::ErrorBootselMiss => "DEVICE_ERROR_BOOTSEL_MISS",
            Self::ErrorFlashInquiry => "DEVICE_ERROR_FLASH_INQUIRY",
            Self::ErrorFlashMount => "DEVICE_ERROR_FLASH_MOUNT",
            Self::ErrorFlashOpen => "DEVICE_ERROR_FLASH_OPEN",
            Self::ErrorFlashWrite => "DEVICE_ERROR_FLASH_WRITE",
            Self::ErrorFlashClose => "DEVICE_ERROR_FLASH_CLOSE",
            Self::Disconnected => "DEVICE_DISCONNECTED",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw status byte of one USB port
///
/// Bits 0-4 hold the lifecycle ordinal, bit 4 doubles as the error flag and
/// bits 5-7 are mount flags that must be tested as a mask, not as an ordinal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u8);

impl StatusCode {
    /// Baseline code of a port that has not been touched since the last clear
    pub const UNKNOWN: StatusCode = StatusCode(DeviceState::Unknown as u8);

    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    /// Lifecycle ordinal (low 5 bits)
    pub fn ordinal(self) -> u8 {
        self.0 & ORDINAL_MASK
    }

    /// Whether the error flag is set
    pub fn is_error(self) -> bool {
        self.0 & ERROR_FLAG != 0
    }

    /// Whether every bit of `mask` is set
    pub fn has_flags(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// Mount flags only
    pub fn mount_flags(self) -> u8 {
        self.0 & MOUNT_FLAGS
    }

    /// Decoded state, if the ordinal is one the firmware defines
    pub fn state(self) -> Option<DeviceState> {
        DeviceState::from_ordinal(self.ordinal())
    }

    /// Copy of this code with a different lifecycle ordinal, mount flags kept
    pub fn with_state(self, state: DeviceState) -> Self {
        Self((self.0 & MOUNT_FLAGS) | state.ordinal())
    }
}

impl From<u8> for StatusCode {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl From<DeviceState> for StatusCode {
    fn from(state: DeviceState) -> Self {
        Self(state.ordinal())
    }
}

impl fmt::LowerHex for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            Some(state) => write!(f, "{} (0x{:02x})", state, self.0)?,
            None => write!(f, "??? (0x{:02x})", self.0)?,
        }

        let mut mounts = Vec::new();
        if self.has_flags(TUH_MOUNTED) {
            mounts.push("tuh");
        }
        if self.has_flags(MSC_MOUNTED) {
            mounts.push("msc");
        }
        if self.has_flags(CDC_MOUNTED) {
            mounts.push("cdc");
        }
        if !mounts.is_empty() {
            write!(f, " [{}]", mounts.join(", "))?;
        }
        Ok(())
    }
}
