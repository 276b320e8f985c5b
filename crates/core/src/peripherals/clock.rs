//! System clock control with configuration change protection.
//!
//! CLK.CTRL is a protected register: software must write the IOREG
//! signature (0xD8) to CCP, after which the protected write has to follow
//! within four instructions. The bus counts accesses instead of cycles.

/// CCP signature that unlocks protected I/O registers.
pub const CCP_IOREG: u8 = 0xD8;
/// Bus accesses a CCP unlock stays open.
pub const CCP_WINDOW: u8 = 4;

/// CLK.CTRL system clock selection values
pub const SCLKSEL_RC2M: u8 = 0x00;
pub const SCLKSEL_RC32M: u8 = 0x01;
pub const SCLKSEL_RC32K: u8 = 0x02;

pub struct Clock {
    pub ctrl: u8,
    /// Remaining accesses in an open CCP window
    window: u8,
    /// Protected writes dropped because CCP was not open
    pub rejected_writes: u32,
}

impl Clock {
    pub fn new() -> Self {
        Clock { ctrl: SCLKSEL_RC2M, window: 0, rejected_writes: 0 }
    }

    pub fn reset(&mut self) {
        *self = Clock::new();
    }

    pub fn write_ccp(&mut self, value: u8) {
        self.window = if value == CCP_IOREG { CCP_WINDOW + 1 } else { 0 };
    }

    /// Called once per bus access.
    pub fn tick(&mut self) {
        self.window = self.window.saturating_sub(1);
    }

    pub fn write_ctrl(&mut self, value: u8) {
        if self.window > 0 {
            self.ctrl = value & 0x07;
            self.window = 0;
        } else {
            self.rejected_writes += 1;
        }
    }

    /// System clock frequency in Hz for the selected source.
    pub fn frequency(&self) -> u32 {
        match self.ctrl & 0x07 {
            SCLKSEL_RC2M => 2_000_000,
            SCLKSEL_RC32M => 32_000_000,
            SCLKSEL_RC32K => 32_768,
            // external sources are board dependent
            _ => 0,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
