//! XMega program memory model.
//!
//! Flash is split into an application section and a boot section:
//!
//! | Address Range (ATxmega128A1) | Content                    |
//! |------------------------------|----------------------------|
//! | 0x00000–0x1FFFF              | Application section (128 KB) |
//! | 0x20000–0x21FFF              | Boot section (8 KB)        |
//!
//! The bootloader may only program the application section. Some images
//! are linked above a protected low region, in which case `app_start` is
//! raised (0x10000 in the reference board setup).

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, NvmError};

/// Erased flash byte.
pub const ERASED: u8 = 0xFF;
/// Erased flash word.
pub const ERASED_WORD: u16 = 0xFFFF;

/// Flash geometry and section boundaries, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    pub flash_size: u32,
    pub page_size: u32,
    pub app_start: u32,
    pub boot_start: u32,
}

impl FlashLayout {
    /// ATxmega128A1: 128 KB application + 8 KB boot section, 512-byte pages.
    pub const XMEGA128A1: FlashLayout = FlashLayout {
        flash_size: 0x22000,
        page_size: 512,
        app_start: 0x00000,
        boot_start: 0x20000,
    };

    /// Same geometry with the application linked at a higher address.
    pub fn with_app_start(self, app_start: u32) -> FlashLayout {
        FlashLayout { app_start, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() || self.page_size < 2 {
            return Err(ConfigError::InvalidLayout("page size must be an even power of two"));
        }
        if self.flash_size % self.page_size != 0 {
            return Err(ConfigError::InvalidLayout("flash size is not a multiple of the page size"));
        }
        if self.app_start % self.page_size != 0 || self.boot_start % self.page_size != 0 {
            return Err(ConfigError::InvalidLayout("section boundaries must be page aligned"));
        }
        if self.app_start >= self.boot_start {
            return Err(ConfigError::InvalidLayout("application section is empty"));
        }
        if self.boot_start > self.flash_size {
            return Err(ConfigError::InvalidLayout("boot section starts beyond flash"));
        }
        Ok(())
    }

    /// Words per page.
    #[inline]
    pub fn page_words(&self) -> usize {
        (self.page_size / 2) as usize
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.flash_size / self.page_size
    }

    /// Page number containing a byte address.
    #[inline]
    pub fn page_of(&self, address: u32) -> u32 {
        address / self.page_size
    }

    /// Word offset of a byte address within its page.
    #[inline]
    pub fn word_offset(&self, address: u32) -> u16 {
        ((address % self.page_size) / 2) as u16
    }

    /// True if the byte address is programmable by the bootloader.
    #[inline]
    pub fn is_app_address(&self, address: u32) -> bool {
        address >= self.app_start && address < self.boot_start
    }

    /// Check that `len` bytes starting at `address` are all programmable.
    pub fn check_app_range(&self, address: u32, len: u32) -> Result<(), NvmError> {
        if !self.is_app_address(address) {
            return Err(NvmError::AddressOutOfRange { address });
        }
        if len > 0 {
            let last = address.checked_add(len - 1).ok_or(NvmError::AddressOutOfRange { address })?;
            if !self.is_app_address(last) {
                return Err(NvmError::AddressOutOfRange { address: last });
            }
        }
        Ok(())
    }

    /// Page numbers of the application section.
    pub fn app_pages(&self) -> std::ops::Range<u32> {
        self.page_of(self.app_start)..self.page_of(self.boot_start)
    }
}

impl Default for FlashLayout {
    fn default() -> Self {
        FlashLayout::XMEGA128A1
    }
}

/// Program memory contents.
pub struct FlashMemory {
    pub layout: FlashLayout,
    /// Raw flash bytes, erased state is 0xFF
    pub flash: Vec<u8>,
}

impl FlashMemory {
    pub fn new(layout: FlashLayout) -> Self {
        FlashMemory { layout, flash: vec![ERASED; layout.flash_size as usize] }
    }

    /// Read 16-bit word from flash at word address (little-endian)
    #[inline(always)]
    pub fn read_program_word(&self, word_addr: usize) -> u16 {
        let byte_addr = word_addr * 2;
        if byte_addr + 1 < self.flash.len() {
            self.flash[byte_addr] as u16 | ((self.flash[byte_addr + 1] as u16) << 8)
        } else {
            ERASED_WORD
        }
    }

    /// Read single byte from flash at byte address
    #[inline(always)]
    pub fn read_flash_byte(&self, byte_addr: usize) -> u8 {
        self.flash.get(byte_addr).copied().unwrap_or(ERASED)
    }

    /// Bytes of one page, empty if the page does not exist.
    pub fn page(&self, page: u32) -> &[u8] {
        let size = self.layout.page_size as usize;
        let start = page as usize * size;
        self.flash.get(start..start + size).unwrap_or(&[])
    }

    /// Erase-write one page from a word buffer. Returns false if the page
    /// does not exist.
    pub fn write_page(&mut self, page: u32, words: &[u16]) -> bool {
        let size = self.layout.page_size as usize;
        let start = page as usize * size;
        let Some(dst) = self.flash.get_mut(start..start + size) else {
            return false;
        };
        for (chunk, word) in dst.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        true
    }

    /// Erase the application section.
    pub fn erase_application(&mut self) {
        let start = self.layout.app_start as usize;
        let end = (self.layout.boot_start as usize).min(self.flash.len());
        self.flash[start..end].fill(ERASED);
    }

    /// Application section bytes.
    pub fn application(&self) -> &[u8] {
        let end = (self.layout.boot_start as usize).min(self.flash.len());
        &self.flash[self.layout.app_start as usize..end]
    }
}
