//! Blocking byte I/O over a USART.
//!
//! [`UsartTransport`] polls the STATUS flags of the configured instance
//! through a [`RegisterBus`]. With no poll limit the waits never end, which
//! is what the device does when the host goes away. A host harness sets a
//! limit so a stalled run ends in [`TransportError::Timeout`].

use crate::error::TransportError;
use crate::peripherals::{regs, RegisterBus, UsartInstance};

/// Blocking single-byte serial I/O.
pub trait ByteIo {
    fn get_char(&mut self) -> Result<u8, TransportError>;
    fn put_char(&mut self, byte: u8) -> Result<(), TransportError>;

    fn put_str(&mut self, text: &str) -> Result<(), TransportError> {
        for &b in text.as_bytes() {
            self.put_char(b)?;
        }
        Ok(())
    }
}

/// Resolved register addresses of one USART instance.
#[derive(Debug, Clone, Copy)]
struct UsartRegs {
    base: u16,
    data: u16,
    status: u16,
}

pub struct UsartTransport<B: RegisterBus> {
    pub bus: B,
    instance: UsartInstance,
    regs: UsartRegs,
    poll_limit: Option<u32>,
}

impl<B: RegisterBus> UsartTransport<B> {
    /// Returns `None` if the instance has no USART.
    pub fn new(bus: B, instance: UsartInstance, poll_limit: Option<u32>) -> Option<Self> {
        let base = instance.base()?;
        let regs = UsartRegs {
            base,
            data: base + regs::DATA,
            status: base + regs::STATUS,
        };
        Some(UsartTransport { bus, instance, regs, poll_limit })
    }

    pub fn instance(&self) -> UsartInstance {
        self.instance
    }

    /// Address of a register of the configured instance.
    pub fn reg(&self, offset: u16) -> u16 {
        self.regs.base + offset
    }

    fn wait_status(&mut self, flag: u8) -> Result<(), TransportError> {
        let mut polls = 0u32;
        while self.bus.read(self.regs.status) & flag == 0 {
            polls = polls.saturating_add(1);
            if let Some(limit) = self.poll_limit {
                if polls >= limit {
                    return Err(TransportError::Timeout { polls });
                }
            }
            std::hint::spin_loop();
        }
        Ok(())
    }
}

impl<B: RegisterBus> ByteIo for UsartTransport<B> {
    fn get_char(&mut self) -> Result<u8, TransportError> {
        self.wait_status(regs::RXCIF)?;
        Ok(self.bus.read(self.regs.data))
    }

    fn put_char(&mut self, byte: u8) -> Result<(), TransportError> {
        self.wait_status(regs::DREIF)?;
        self.bus.write(self.regs.data, byte);
        Ok(())
    }
}
