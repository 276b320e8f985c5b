//! Error types for the bootloader core.
//!
//! Parser, NVM and transport errors are kept apart so callers can tell a
//! bad line from a hardware problem. [`BootError`] wraps all of them for
//! the session level.

use thiserror::Error;

/// Intel-HEX line and record errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    /// The two's-complement checksum at the end of the record did not match.
    #[error("checksum mismatch: expected 0x{expected:02X}, found 0x{found:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },

    /// The record is structurally invalid.
    #[error("malformed record: {0}")]
    MalformedRecord(&'static str),

    /// More characters arrived than a record can hold before the line end.
    #[error("line overflow: more than {0} characters before line end")]
    LineOverflow(usize),
}

/// Flash self-programming errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvmError {
    /// The device reported a failed erase-write of a page.
    #[error("flash write failure on page {page}")]
    FlashWriteFailure { page: u32 },

    /// Target address lies outside the application section.
    #[error("address 0x{address:05X} is outside the application section")]
    AddressOutOfRange { address: u32 },

    /// A record targets a page that was already committed this session.
    #[error("page {page} was already written")]
    PageRewrite { page: u32 },
}

/// Serial transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A status flag did not come up within the configured poll limit.
    #[error("transport timeout after {polls} status polls")]
    Timeout { polls: u32 },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),

    #[error("invalid flash layout: {0}")]
    InvalidLayout(&'static str),

    #[error("invalid pin {pin} (port pins are 0..=7)")]
    InvalidPin { pin: u8 },

    #[error("{0} has no USART")]
    NoUsart(String),

    #[error("TX and RX cannot share pin {0}")]
    PinConflict(u8),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-level error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error(transparent)]
    Hex(#[from] HexError),

    #[error(transparent)]
    Nvm(#[from] NvmError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Operation not allowed in the current session state.
    #[error("operation not allowed in state {0}")]
    InvalidState(&'static str),
}

/// Device state file errors.
#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file too small")]
    TooSmall,

    #[error("invalid device state file (bad magic)")]
    BadMagic,

    #[error("unsupported device state version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("decompress error: {0}")]
    Decompress(String),

    #[error("serialize error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("flash image size {found} does not match layout size {expected}")]
    SizeMismatch { found: usize, expected: usize },

    #[error("saved flash layout differs from the device layout")]
    LayoutMismatch,

    #[error("invalid saved layout: {0}")]
    Layout(#[from] ConfigError),
}
