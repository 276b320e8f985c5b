//! XMega USART emulation.
//!
//! Handles DATA, STATUS, CTRLA/B/C and BAUDCTRLA/B. Transmission is instant:
//! DREIF stays set while the transmitter is enabled and every byte written
//! to DATA lands in [`Usart::tx`]. Received bytes come from a host feed
//! that honours XON/XOFF, one byte per STATUS poll, so a polling receiver
//! sees them arrive the way it would on a real link.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{XOFF, XON};

/// Register offsets from the instance base.
pub const DATA: u16 = 0x00;
pub const STATUS: u16 = 0x01;
pub const CTRLA: u16 = 0x03;
pub const CTRLB: u16 = 0x04;
pub const CTRLC: u16 = 0x05;
pub const BAUDCTRLA: u16 = 0x06;
pub const BAUDCTRLB: u16 = 0x07;
/// Size of one instance's register block.
pub const BLOCK_SIZE: u16 = 0x08;

/// STATUS bits
pub const RXCIF: u8 = 0x80;
pub const TXCIF: u8 = 0x40;
pub const DREIF: u8 = 0x20;
/// CTRLB bits
pub const RXEN: u8 = 0x10;
pub const TXEN: u8 = 0x08;

/// Bootloader baud rates for the 2 MHz internal oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }

    /// (BSEL, BSCALE) register values.
    pub fn divider(self) -> (u16, i8) {
        match self {
            BaudRate::B9600 => (12, 0),
            BaudRate::B19200 => (11, -1),
            BaudRate::B38400 => (9, -2),
            BaudRate::B57600 => (75, -6),
            BaudRate::B115200 => (11, -7),
        }
    }

    /// BAUDCTRLA and BAUDCTRLB register values.
    pub fn registers(self) -> (u8, u8) {
        let (bsel, bscale) = self.divider();
        let a = (bsel & 0xFF) as u8;
        let b = (((bscale as u8) << 4) & 0xF0) | ((bsel >> 8) as u8 & 0x0F);
        (a, b)
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = ConfigError;

    fn try_from(baud: u32) -> Result<Self, Self::Error> {
        match baud {
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            38400 => Ok(BaudRate::B38400),
            57600 => Ok(BaudRate::B57600),
            115200 => Ok(BaudRate::B115200),
            other => Err(ConfigError::UnsupportedBaud(other)),
        }
    }
}

impl From<BaudRate> for u32 {
    fn from(b: BaudRate) -> u32 {
        b.bits_per_second()
    }
}

/// Actual bit rate produced by BSEL/BSCALE at `f_per` Hz (normal speed).
pub fn effective_baud(f_per: u32, bsel: u16, bscale: i8) -> f64 {
    let f = f_per as f64;
    if bscale >= 0 {
        f / ((1u32 << bscale) as f64 * 16.0 * (bsel as f64 + 1.0))
    } else {
        let scale = (2.0f64).powi(bscale as i32);
        f / (16.0 * (scale * bsel as f64 + 1.0))
    }
}

pub struct Usart {
    pub ctrla: u8,
    pub ctrlb: u8,
    pub ctrlc: u8,
    pub baudctrla: u8,
    pub baudctrlb: u8,
    txcif: bool,
    rx_fifo: VecDeque<u8>,
    /// Bytes the simulated host still has to send
    host_pending: VecDeque<u8>,
    /// Host stopped by XOFF
    pub host_paused: bool,
    /// Everything the device transmitted
    pub tx: Vec<u8>,
}

impl Usart {
    pub fn new() -> Self {
        Usart {
            ctrla: 0,
            ctrlb: 0,
            // reset value: async, 8N1
            ctrlc: 0x03,
            baudctrla: 0,
            baudctrlb: 0,
            txcif: false,
            rx_fifo: VecDeque::new(),
            host_pending: VecDeque::new(),
            host_paused: false,
            tx: Vec::new(),
        }
    }

    /// Register reset. Host-side buffers survive.
    pub fn reset(&mut self) {
        self.ctrla = 0;
        self.ctrlb = 0;
        self.ctrlc = 0x03;
        self.baudctrla = 0;
        self.baudctrlb = 0;
        self.txcif = false;
        self.rx_fifo.clear();
    }

    pub fn rx_enabled(&self) -> bool {
        self.ctrlb & RXEN != 0
    }

    pub fn tx_enabled(&self) -> bool {
        self.ctrlb & TXEN != 0
    }

    /// BSEL and BSCALE as programmed.
    pub fn divider(&self) -> (u16, i8) {
        let bsel = self.baudctrla as u16 | (((self.baudctrlb & 0x0F) as u16) << 8);
        // sign-extend the 4-bit BSCALE field
        let bscale = (self.baudctrlb as i8) >> 4;
        (bsel, bscale)
    }

    /// Queue bytes for the host to send.
    pub fn host_send(&mut self, bytes: &[u8]) {
        self.host_pending.extend(bytes);
    }

    /// Bytes the host has not delivered yet.
    pub fn host_pending(&self) -> usize {
        self.host_pending.len()
    }

    fn pump_host(&mut self) {
        if self.rx_fifo.is_empty() && !self.host_paused && self.rx_enabled() {
            if let Some(b) = self.host_pending.pop_front() {
                self.rx_fifo.push_back(b);
            }
        }
    }

    /// Returns true if this offset is handled
    pub fn write(&mut self, offset: u16, value: u8) -> bool {
        match offset {
            DATA => {
                if self.tx_enabled() {
                    match value {
                        XOFF => self.host_paused = true,
                        XON => self.host_paused = false,
                        _ => {}
                    }
                    self.tx.push(value);
                    self.txcif = true;
                }
                true
            }
            STATUS => {
                // TXCIF is cleared by writing one
                if value & TXCIF != 0 { self.txcif = false; }
                true
            }
            CTRLA => { self.ctrla = value; true }
            CTRLB => {
                self.ctrlb = value;
                if !self.rx_enabled() { self.rx_fifo.clear(); }
                true
            }
            CTRLC => { self.ctrlc = value; true }
            BAUDCTRLA => { self.baudctrla = value; true }
            BAUDCTRLB => { self.baudctrlb = value; true }
            _ => false,
        }
    }

    pub fn read(&mut self, offset: u16) -> Option<u8> {
        match offset {
            DATA => Some(self.rx_fifo.pop_front().unwrap_or(0)),
            STATUS => {
                self.pump_host();
                let mut val = 0u8;
                if !self.rx_fifo.is_empty() { val |= RXCIF; }
                if self.txcif { val |= TXCIF; }
                if self.tx_enabled() { val |= DREIF; }
                Some(val)
            }
            CTRLA => Some(self.ctrla),
            CTRLB => Some(self.ctrlb),
            CTRLC => Some(self.ctrlc),
            BAUDCTRLA => Some(self.baudctrla),
            BAUDCTRLB => Some(self.baudctrlb),
            _ => None,
        }
    }
}

impl Default for Usart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_table() {
        assert_eq!(BaudRate::B9600.registers(), (12, 0x00));
        assert_eq!(BaudRate::B19200.registers(), (11, 0xF0));
        assert_eq!(BaudRate::B38400.registers(), (9, 0xE0));
        assert_eq!(BaudRate::B57600.registers(), (75, 0xA0));
        assert_eq!(BaudRate::B115200.registers(), (11, 0x90));
    }

    #[test]
    fn test_baud_error_within_two_percent() {
        for baud in [9600u32, 19200, 38400, 57600, 115200] {
            let rate = BaudRate::try_from(baud).unwrap();
            let (bsel, bscale) = rate.divider();
            let actual = effective_baud(crate::F_CPU, bsel, bscale);
            let err = (actual - baud as f64).abs() / baud as f64;
            assert!(err < 0.02, "{} baud off by {:.2}%", baud, err * 100.0);
        }
    }

    #[test]
    fn test_unsupported_baud() {
        assert!(matches!(BaudRate::try_from(4800), Err(ConfigError::UnsupportedBaud(4800))));
    }

    #[test]
    fn test_divider_readback() {
        let mut u = Usart::new();
        let (a, b) = BaudRate::B57600.registers();
        u.write(BAUDCTRLA, a);
        u.write(BAUDCTRLB, b);
        assert_eq!(u.divider(), (75, -6));
    }

    #[test]
    fn test_receive_needs_rxen() {
        let mut u = Usart::new();
        u.host_send(b"x");
        assert_eq!(u.read(STATUS).unwrap() & RXCIF, 0);
        u.write(CTRLB, RXEN | TXEN);
        assert_eq!(u.read(STATUS).unwrap() & RXCIF, RXCIF);
        assert_eq!(u.read(DATA), Some(b'x'));
        assert_eq!(u.read(STATUS).unwrap() & RXCIF, 0);
    }

    #[test]
    fn test_xoff_pauses_host() {
        let mut u = Usart::new();
        u.write(CTRLB, RXEN | TXEN);
        u.host_send(b"ab");
        u.read(STATUS);
        assert_eq!(u.read(DATA), Some(b'a'));

        u.write(DATA, XOFF);
        assert_eq!(u.read(STATUS).unwrap() & RXCIF, 0);
        assert_eq!(u.host_pending(), 1);

        u.write(DATA, XON);
        assert_eq!(u.read(STATUS).unwrap() & RXCIF, RXCIF);
        assert_eq!(u.read(DATA), Some(b'b'));
        assert_eq!(u.tx, vec![XOFF, XON]);
    }

    #[test]
    fn test_transmit_disabled_drops_bytes() {
        let mut u = Usart::new();
        assert_eq!(u.read(STATUS).unwrap() & DREIF, 0);
        u.write(DATA, b'A');
        assert!(u.tx.is_empty());
    }
}
