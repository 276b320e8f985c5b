//! XMega peripheral emulation.
//!
//! Contains the hardware the bootloader touches:
//!
//! - [`Clock`]: CLK.CTRL behind configuration change protection (CCP)
//! - [`Port`]: I/O port direction and output registers (USART pins)
//! - [`Usart`]: USART with a host feed that honours XON/XOFF
//!
//! [`SimBus`] maps them into the ATxmega128A1 data space and implements
//! [`RegisterBus`], the accessor interface the bootloader core is written
//! against.

mod clock;
mod port;
pub mod usart;

pub use clock::{Clock, CCP_IOREG, SCLKSEL_RC2M, SCLKSEL_RC32M};
pub use port::Port;
pub use usart::{BaudRate, Usart};

use serde::{Deserialize, Serialize};

/// Register offsets re-exported for bus users.
pub mod regs {
    pub use super::port::{DIR, DIRCLR, DIRSET, OUT};
    pub use super::usart::{
        BAUDCTRLA, BAUDCTRLB, CTRLA, CTRLB, CTRLC, DATA, DREIF, RXCIF, RXEN, STATUS, TXCIF, TXEN,
    };
}

/// Configuration change protection register.
pub const CCP_ADDR: u16 = 0x0034;
/// CLK.CTRL
pub const CLK_CTRL_ADDR: u16 = 0x0040;
/// PORTA base, ports follow every 0x20 bytes
pub const PORT_BASE: u16 = 0x0600;
/// USARTC0 base
pub const USART_BASE: u16 = 0x08A0;
/// Distance between USART blocks of neighbouring ports (C→D→E→F)
pub const USART_PORT_STRIDE: u16 = 0x0100;
/// Distance between USART0 and USART1 on one port
pub const USART_INDEX_STRIDE: u16 = 0x0010;

/// Byte-wide memory-mapped register access.
///
/// Firmware implements this with volatile loads and stores; the host
/// simulation implements it with [`SimBus`].
pub trait RegisterBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);

    /// Read-modify-write helpers
    fn set_bits(&mut self, addr: u16, mask: u8) {
        let v = self.read(addr);
        self.write(addr, v | mask);
    }

    fn clear_bits(&mut self, addr: u16, mask: u8) {
        let v = self.read(addr);
        self.write(addr, v & !mask);
    }
}

/// XMega I/O port letters. Virtual ports and gaps in the letter sequence
/// follow the ATxmega128A1 register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortId {
    A, B, C, D, E, F, H, J, K, Q, R,
}

impl PortId {
    pub const ALL: [PortId; 11] = [
        PortId::A, PortId::B, PortId::C, PortId::D, PortId::E, PortId::F,
        PortId::H, PortId::J, PortId::K, PortId::Q, PortId::R,
    ];

    /// Slot in the port register area (PORTA = 0 … PORTR = 15).
    fn slot(self) -> u16 {
        match self {
            PortId::A => 0,
            PortId::B => 1,
            PortId::C => 2,
            PortId::D => 3,
            PortId::E => 4,
            PortId::F => 5,
            PortId::H => 7,
            PortId::J => 8,
            PortId::K => 9,
            PortId::Q => 14,
            PortId::R => 15,
        }
    }

    pub fn base(self) -> u16 {
        PORT_BASE + self.slot() * port::BLOCK_SIZE
    }

    fn index(self) -> usize {
        PortId::ALL.iter().position(|&p| p == self).unwrap_or(0)
    }
}

/// A USART instance, e.g. `C0` for USARTC0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsartInstance {
    pub port: PortId,
    pub index: u8,
}

impl UsartInstance {
    pub const ALL: [UsartInstance; 8] = [
        UsartInstance { port: PortId::C, index: 0 },
        UsartInstance { port: PortId::C, index: 1 },
        UsartInstance { port: PortId::D, index: 0 },
        UsartInstance { port: PortId::D, index: 1 },
        UsartInstance { port: PortId::E, index: 0 },
        UsartInstance { port: PortId::E, index: 1 },
        UsartInstance { port: PortId::F, index: 0 },
        UsartInstance { port: PortId::F, index: 1 },
    ];

    /// Register block base address, `None` for ports without a USART.
    pub fn base(self) -> Option<u16> {
        let port_step = match self.port {
            PortId::C => 0,
            PortId::D => 1,
            PortId::E => 2,
            PortId::F => 3,
            _ => return None,
        };
        if self.index > 1 {
            return None;
        }
        Some(USART_BASE + port_step * USART_PORT_STRIDE + self.index as u16 * USART_INDEX_STRIDE)
    }

    /// Register address of `offset` within this instance.
    pub fn reg(self, offset: u16) -> Option<u16> {
        self.base().map(|b| b + offset)
    }

    fn slot(self) -> Option<usize> {
        UsartInstance::ALL.iter().position(|&u| u == self)
    }
}

impl std::fmt::Display for UsartInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{}", self.port, self.index)
    }
}

impl std::str::FromStr for UsartInstance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches("USART").trim_start_matches("usart");
        let found = UsartInstance::ALL.iter().copied().find(|u| u.to_string().eq_ignore_ascii_case(s));
        found.ok_or_else(|| format!("unknown USART instance '{}' (expected C0..F1)", s))
    }
}

impl TryFrom<String> for UsartInstance {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<UsartInstance> for String {
    fn from(u: UsartInstance) -> String {
        u.to_string()
    }
}

/// Simulated ATxmega128A1 I/O space.
pub struct SimBus {
    pub clock: Clock,
    pub ports: Vec<Port>,
    pub usarts: Vec<Usart>,
    /// Writes to addresses nothing decodes
    pub unmapped_writes: u32,
}

impl SimBus {
    pub fn new() -> Self {
        SimBus {
            clock: Clock::new(),
            ports: PortId::ALL.iter().map(|_| Port::new()).collect(),
            usarts: UsartInstance::ALL.iter().map(|_| Usart::new()).collect(),
            unmapped_writes: 0,
        }
    }

    /// Register reset of every peripheral. Host feeds and TX logs survive.
    pub fn reset(&mut self) {
        self.clock.reset();
        self.ports.iter_mut().for_each(Port::reset);
        self.usarts.iter_mut().for_each(Usart::reset);
    }

    pub fn port(&self, id: PortId) -> &Port {
        &self.ports[id.index()]
    }

    pub fn usart(&self, inst: UsartInstance) -> Option<&Usart> {
        inst.slot().map(|i| &self.usarts[i])
    }

    pub fn usart_mut(&mut self, inst: UsartInstance) -> Option<&mut Usart> {
        inst.slot().map(move |i| &mut self.usarts[i])
    }

    fn decode_port(addr: u16) -> Option<(usize, u16)> {
        PortId::ALL.iter().enumerate().find_map(|(i, p)| {
            let base = p.base();
            (addr >= base && addr < base + port::BLOCK_SIZE).then(|| (i, addr - base))
        })
    }

    fn decode_usart(addr: u16) -> Option<(usize, u16)> {
        UsartInstance::ALL.iter().enumerate().find_map(|(i, u)| {
            let base = u.base()?;
            (addr >= base && addr < base + usart::BLOCK_SIZE).then(|| (i, addr - base))
        })
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBus for SimBus {
    fn read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            CLK_CTRL_ADDR => self.clock.ctrl,
            CCP_ADDR => 0,
            _ => {
                if let Some((i, off)) = Self::decode_port(addr) {
                    self.ports[i].read(off).unwrap_or(0)
                } else if let Some((i, off)) = Self::decode_usart(addr) {
                    self.usarts[i].read(off).unwrap_or(0)
                } else {
                    0
                }
            }
        };
        self.clock.tick();
        value
    }

    fn write(&mut self, addr: u16, value: u8) {
        let handled = match addr {
            CCP_ADDR => { self.clock.write_ccp(value); true }
            CLK_CTRL_ADDR => { self.clock.write_ctrl(value); true }
            _ => {
                if let Some((i, off)) = Self::decode_port(addr) {
                    self.ports[i].write(off, value)
                } else if let Some((i, off)) = Self::decode_usart(addr) {
                    self.usarts[i].write(off, value)
                } else {
                    false
                }
            }
        };
        if !handled {
            self.unmapped_writes += 1;
        }
        self.clock.tick();
    }
}
