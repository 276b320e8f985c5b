//! Bootloader configuration.
//!
//! Replaces the compile-time `BOOTLOADER_INTERFACE` / `BOOTLOADER_BAUD`
//! selection with a value resolved when the bootloader is constructed.
//! Host tools load it from JSON:
//!
//! ```json
//! {
//!   "interface": "E0",
//!   "baud": 9600,
//!   "tx_pin": 3,
//!   "rx_pin": 2,
//!   "layout": { "flash_size": 139264, "page_size": 512, "app_start": 65536, "boot_start": 131072 },
//!   "poll_limit": 1000000
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::memory::FlashLayout;
use crate::peripherals::{BaudRate, PortId, UsartInstance};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootloaderConfig {
    /// USART used for the transfer
    pub interface: UsartInstance,
    pub baud: BaudRate,
    /// TX pin on the interface's port
    pub tx_pin: u8,
    /// RX pin on the interface's port
    pub rx_pin: u8,
    pub layout: FlashLayout,
    /// Upper bound on status polls per byte; `None` blocks forever
    pub poll_limit: Option<u32>,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        BootloaderConfig {
            interface: UsartInstance { port: PortId::C, index: 0 },
            baud: BaudRate::B19200,
            tx_pin: 3,
            rx_pin: 2,
            layout: FlashLayout::default(),
            poll_limit: None,
        }
    }
}

impl BootloaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pin in [self.tx_pin, self.rx_pin] {
            if pin > 7 {
                return Err(ConfigError::InvalidPin { pin });
            }
        }
        if self.tx_pin == self.rx_pin {
            return Err(ConfigError::PinConflict(self.tx_pin));
        }
        self.layout.validate()
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: BootloaderConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
