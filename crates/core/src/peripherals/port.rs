//! XMega I/O port emulation.
//!
//! Only direction and output registers are modelled; the bootloader uses
//! DIRSET/DIRCLR to claim and release the USART pins.

/// Register offsets from the port base.
pub const DIR: u16 = 0x00;
pub const DIRSET: u16 = 0x01;
pub const DIRCLR: u16 = 0x02;
pub const DIRTGL: u16 = 0x03;
pub const OUT: u16 = 0x04;
pub const OUTSET: u16 = 0x05;
pub const OUTCLR: u16 = 0x06;
pub const OUTTGL: u16 = 0x07;
pub const IN: u16 = 0x08;
/// Size of one port's register block.
pub const BLOCK_SIZE: u16 = 0x20;

pub struct Port {
    pub dir: u8,
    pub out: u8,
    /// Externally driven pin levels
    pub pins: u8,
}

impl Port {
    pub fn new() -> Self {
        Port { dir: 0, out: 0, pins: 0xFF }
    }

    pub fn reset(&mut self) {
        self.dir = 0;
        self.out = 0;
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.dir & (1 << pin) != 0
    }

    /// Returns true if this offset is handled
    pub fn write(&mut self, offset: u16, value: u8) -> bool {
        match offset {
            DIR => self.dir = value,
            DIRSET => self.dir |= value,
            DIRCLR => self.dir &= !value,
            DIRTGL => self.dir ^= value,
            OUT => self.out = value,
            OUTSET => self.out |= value,
            OUTCLR => self.out &= !value,
            OUTTGL => self.out ^= value,
            _ => return false,
        }
        true
    }

    pub fn read(&self, offset: u16) -> Option<u8> {
        match offset {
            DIR | DIRSET | DIRCLR | DIRTGL => Some(self.dir),
            OUT | OUTSET | OUTCLR | OUTTGL => Some(self.out),
            // outputs read back their driven level
            IN => Some((self.out & self.dir) | (self.pins & !self.dir)),
            _ => None,
        }
    }
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}
