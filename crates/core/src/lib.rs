//! # xmega-boot-core
//!
//! USART bootloader for the ATxmega128A1 plus a register-level host model
//! of the hardware it drives.
//!
//! The bootloader receives an Intel-HEX image over a serial link, programs
//! it page by page into the application section through the NVM
//! self-programming interface, locks SPM and reports where control goes
//! next.
//!
//! ## Architecture
//!
//! - [`Bootloader`]: session context wiring transport, NVM and parser
//! - [`transport`]: [`ByteIo`] and the polled [`UsartTransport`]
//! - [`hex`]: line assembly, record decoding, whole-file loader
//! - [`nvm`]: [`Nvm`] command set, [`SimNvm`] model, [`PageWriter`]
//! - [`memory`]: [`FlashLayout`] and the flash array
//! - [`peripherals`]: clock, ports and USARTs behind [`SimBus`]
//! - [`config`]: [`BootloaderConfig`], loaded from JSON
//! - [`session`]: session states and [`ExitAction`]
//! - [`savestate`]: persisted simulated device flash
//!
//! ## Protocol
//!
//! 1. `init`: erase application, clear page buffer, 2 MHz clock, pins,
//!    baud, enable USART, send `'A'`
//! 2. `enter`: per line, `XOFF` → parse → program → `XON`, until EOF
//! 3. `exit`: announce, lock SPM, release pins and USART

pub mod config;
pub mod error;
pub mod hex;
pub mod memory;
pub mod nvm;
pub mod peripherals;
pub mod savestate;
pub mod session;
pub mod transport;

pub use config::BootloaderConfig;
pub use error::{BootError, ConfigError, HexError, NvmError, TransportError};
pub use memory::FlashLayout;
pub use nvm::{Nvm, PageWriter, SimNvm};
pub use peripherals::{RegisterBus, SimBus, UsartInstance};
pub use session::{ExitAction, Session, SessionState};
pub use transport::{ByteIo, UsartTransport};

use tracing::{debug, info, warn};

use hex::{AddressState, LineAssembler, LineStatus, Record, RecordKind};
use peripherals::{regs, CCP_ADDR, CCP_IOREG, CLK_CTRL_ADDR, SCLKSEL_RC2M};

/// Peripheral clock after `init` (internal 2 MHz RC oscillator)
pub const F_CPU: u32 = 2_000_000;
/// Sent once the USART is up
pub const HANDSHAKE: u8 = b'A';
/// Resume transmission
pub const XON: u8 = 0x11;
/// Pause transmission
pub const XOFF: u8 = 0x13;

pub const ENTER_MESSAGE: &str = "Enter bootloader...\n\r";
pub const LEAVE_MESSAGE: &str = "Leave bootloader...\n\r";

/// Bootloader session context.
///
/// Owns its transport, NVM and parser state; nothing is shared.
pub struct Bootloader<B: RegisterBus, N: Nvm> {
    pub io: UsartTransport<B>,
    pub nvm: N,
    pub session: Session,
    config: BootloaderConfig,
    line: LineAssembler,
    writer: PageWriter,
    addresses: AddressState,
    initialized: bool,
}

impl<B: RegisterBus, N: Nvm> Bootloader<B, N> {
    pub fn new(bus: B, nvm: N, config: BootloaderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let io = UsartTransport::new(bus, config.interface, config.poll_limit)
            .ok_or_else(|| ConfigError::NoUsart(config.interface.to_string()))?;
        Ok(Bootloader {
            io,
            nvm,
            session: Session::new(),
            line: LineAssembler::new(),
            writer: PageWriter::new(config.layout),
            addresses: AddressState::default(),
            initialized: false,
            config,
        })
    }

    pub fn config(&self) -> &BootloaderConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Pages committed in the current session.
    pub fn pages_written(&self) -> u32 {
        self.writer.pages_written
    }

    /// Start address from an SSA/SLA record, else the application start.
    pub fn entry_point(&self) -> u32 {
        self.addresses.entry.unwrap_or(self.config.layout.app_start)
    }

    /// Prepare the device for a transfer and send the handshake.
    pub fn init(&mut self) -> Result<(), BootError> {
        if self.session.state() != SessionState::Idle {
            return Err(BootError::InvalidState(self.session.state().name()));
        }
        // SPM stays locked until reset, nothing could be programmed
        if self.nvm.is_spm_locked() {
            return Err(BootError::InvalidState("SPM locked"));
        }

        self.nvm.erase_application();
        self.nvm.clear_flash_buffer();

        let port = self.config.interface.port.base();
        let baudctrla = self.io.reg(regs::BAUDCTRLA);
        let baudctrlb = self.io.reg(regs::BAUDCTRLB);
        let ctrlb = self.io.reg(regs::CTRLB);
        let (bauda, baudb) = self.config.baud.registers();

        let bus = &mut self.io.bus;
        // CLK.CTRL is protected: the signature opens a 4-access window
        bus.write(CCP_ADDR, CCP_IOREG);
        bus.write(CLK_CTRL_ADDR, SCLKSEL_RC2M);
        bus.write(port + regs::DIRSET, 1 << self.config.tx_pin);
        bus.write(port + regs::DIRCLR, 1 << self.config.rx_pin);
        bus.write(baudctrla, bauda);
        bus.write(baudctrlb, baudb);
        bus.set_bits(ctrlb, regs::RXEN | regs::TXEN);

        self.session = Session::new();
        self.line.reset();
        self.writer = PageWriter::new(self.config.layout);
        self.addresses = AddressState::default();

        self.io.put_char(HANDSHAKE)?;
        self.initialized = true;
        info!(
            interface = %self.config.interface,
            baud = self.config.baud.bits_per_second(),
            app_start = self.config.layout.app_start,
            "bootloader ready"
        );
        Ok(())
    }

    /// Receive and program records until EOF or the first error.
    ///
    /// On error the session is left in `Error` and the error returned;
    /// there is no retry.
    pub fn enter(&mut self) -> Result<(), BootError> {
        if !self.initialized {
            return Err(BootError::InvalidState("uninitialized"));
        }
        self.session.transition(SessionState::Receiving)?;
        match self.receive() {
            Ok(()) => {
                info!(
                    records = self.session.records,
                    bytes = self.session.data_bytes,
                    pages = self.writer.pages_written,
                    "image received"
                );
                Ok(())
            }
            Err(err) => {
                self.session.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Announce departure, lock SPM, release pins and USART.
    ///
    /// Always locks SPM. Only a completed session jumps to the application.
    pub fn exit(&mut self) -> ExitAction {
        if self.initialized {
            if let Err(err) = self.io.put_str(LEAVE_MESSAGE) {
                warn!(error = %err, "leave message not sent");
            }
        }

        self.nvm.lock_spm();

        let port = self.config.interface.port.base();
        let ctrlb = self.io.reg(regs::CTRLB);
        let pins = (1u8 << self.config.tx_pin) | (1u8 << self.config.rx_pin);
        self.io.bus.write(port + regs::DIRCLR, pins);
        self.io.bus.clear_bits(ctrlb, regs::RXEN | regs::TXEN);

        let action = match self.session.state() {
            SessionState::Done => ExitAction::JumpToApplication { entry: self.entry_point() },
            _ => ExitAction::Halt,
        };
        self.session.close();
        self.initialized = false;
        info!(?action, "bootloader exit");
        action
    }

    /// `init`, `enter` and `exit` in sequence.
    pub fn run(&mut self) -> ExitAction {
        let result = match self.init() {
            Ok(()) => self.enter(),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            debug!(error = %err, "session ended with error");
        }
        self.exit()
    }

    fn receive(&mut self) -> Result<(), BootError> {
        self.io.put_str(ENTER_MESSAGE)?;
        loop {
            let byte = self.io.get_char()?;
            if self.line.push(byte)? == LineStatus::Complete && self.process_line()? {
                return Ok(());
            }
        }
    }

    /// Apply one complete line. Returns true once EOF has been applied.
    fn process_line(&mut self) -> Result<bool, BootError> {
        self.io.put_char(XOFF)?;

        let record = Record::parse(self.line.line())?;
        debug!(address = record.address, kind = ?record.kind, "record");
        self.session.records += 1;

        let eof = record.kind == RecordKind::EndOfFile;
        if let Some(address) = self.addresses.apply(&record) {
            if let RecordKind::Data(bytes) = &record.kind {
                self.program(address, bytes)?;
            }
        } else if eof {
            self.session.transition(SessionState::Flashing)?;
            self.writer.finish(&mut self.nvm)?;
        }

        self.io.put_char(XON)?;
        if eof {
            self.session.transition(SessionState::Done)?;
        }
        Ok(eof)
    }

    fn program(&mut self, address: u32, bytes: &[u8]) -> Result<(), BootError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if address % 2 != 0 {
            return Err(HexError::MalformedRecord("odd data address").into());
        }
        self.session.transition(SessionState::Flashing)?;
        self.writer.load_bytes(&mut self.nvm, address, bytes)?;
        self.session.data_bytes += bytes.len() as u32;
        self.session.transition(SessionState::Receiving)
    }
}

impl Bootloader<SimBus, SimNvm> {
    /// Bootloader on a fresh simulated device.
    pub fn simulated(config: BootloaderConfig) -> Result<Self, ConfigError> {
        let nvm = SimNvm::new(config.layout);
        Bootloader::new(SimBus::new(), nvm, config)
    }

    /// Power cycle the simulated device: registers and SPM lock reset,
    /// flash and the host link are kept.
    pub fn power_cycle(&mut self) {
        self.io.bus.reset();
        self.nvm.reset();
    }

    /// Queue bytes for the simulated host to send.
    pub fn host_send(&mut self, bytes: &[u8]) {
        let instance = self.io.instance();
        if let Some(usart) = self.io.bus.usart_mut(instance) {
            usart.host_send(bytes);
        }
    }

    /// Everything the device has transmitted so far.
    pub fn console(&self) -> &[u8] {
        self.io
            .bus
            .usart(self.io.instance())
            .map(|u| u.tx.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex::encode_record;
    use crate::memory::ERASED_WORD;
    use crate::peripherals::PortId;

    const E0: UsartInstance = UsartInstance { port: PortId::E, index: 0 };

    fn config() -> BootloaderConfig {
        BootloaderConfig { interface: E0, poll_limit: Some(1_000), ..Default::default() }
    }

    fn stream(lines: &[String]) -> Vec<u8> {
        lines.iter().flat_map(|l| format!("{}\r\n", l).into_bytes()).collect()
    }

    fn device_with(cfg: BootloaderConfig, lines: &[String]) -> Bootloader<SimBus, SimNvm> {
        let mut boot = Bootloader::simulated(cfg).unwrap();
        boot.host_send(&stream(lines));
        boot
    }

    fn eof() -> String {
        encode_record(0x01, 0, &[])
    }

    #[test]
    fn test_single_record_image() {
        let data: Vec<u8> = (0..16).collect();
        let lines = [encode_record(0x00, 0x0000, &data), eof()];
        assert_eq!(lines[1], ":00000001FF");
        let mut boot = device_with(config(), &lines);

        boot.init().unwrap();
        boot.enter().unwrap();
        assert_eq!(boot.state(), SessionState::Done);
        assert_eq!(boot.session.history[..2], [SessionState::Idle, SessionState::Receiving]);
        assert_eq!(boot.session.history.last(), Some(&SessionState::Done));
        assert_eq!(boot.session.records, 2);
        assert_eq!(boot.session.data_bytes, 16);

        assert_eq!(boot.nvm.commits, vec![0]);
        let page = boot.nvm.mem.page(0);
        assert_eq!(&page[..16], data.as_slice());
        assert!(page[16..].iter().all(|&b| b == 0xFF));

        assert_eq!(boot.exit(), ExitAction::JumpToApplication { entry: 0 });
        assert_eq!(boot.state(), SessionState::Idle);
        assert!(boot.nvm.is_spm_locked());
    }

    #[test]
    fn test_console_output() {
        let lines = [encode_record(0x00, 0, &[1, 2]), eof()];
        let mut boot = device_with(config(), &lines);
        boot.run();

        let mut expected = vec![HANDSHAKE];
        expected.extend_from_slice(ENTER_MESSAGE.as_bytes());
        expected.extend_from_slice(&[XOFF, XON, XOFF, XON]);
        expected.extend_from_slice(LEAVE_MESSAGE.as_bytes());
        assert_eq!(boot.console(), expected.as_slice());
    }

    #[test]
    fn test_init_programs_hardware() {
        let mut boot = Bootloader::simulated(config()).unwrap();
        boot.nvm.mem.flash[0] = 0x00;
        boot.init().unwrap();

        assert_eq!(boot.nvm.mem.flash[0], 0xFF);
        assert_eq!(boot.nvm.erase_count, 1);
        let bus = &boot.io.bus;
        assert_eq!(bus.clock.ctrl, SCLKSEL_RC2M);
        assert_eq!(bus.clock.rejected_writes, 0);
        assert!(bus.port(PortId::E).is_output(3));
        assert!(!bus.port(PortId::E).is_output(2));
        let usart = bus.usart(E0).unwrap();
        assert!(usart.rx_enabled() && usart.tx_enabled());
        assert_eq!(usart.divider(), (11, -1));
        assert_eq!(boot.init(), Ok(()));
    }

    #[test]
    fn test_exit_releases_hardware() {
        let mut boot = device_with(config(), &[eof()]);
        assert_eq!(boot.run(), ExitAction::JumpToApplication { entry: 0 });
        let bus = &boot.io.bus;
        assert!(!bus.port(PortId::E).is_output(3));
        let usart = bus.usart(E0).unwrap();
        assert!(!usart.rx_enabled() && !usart.tx_enabled());
    }

    #[test]
    fn test_bad_checksum_aborts() {
        let mut line = encode_record(0x00, 0, &[0x11; 16]);
        line.truncate(line.len() - 2);
        line.push_str("00");
        let mut boot = device_with(config(), &[line, eof()]);

        boot.init().unwrap();
        let err = boot.enter().unwrap_err();
        assert_eq!(err, BootError::Hex(HexError::ChecksumMismatch { expected: 0xE0, found: 0x00 }));
        assert_eq!(boot.state(), SessionState::Error);
        assert!(boot.nvm.page_buffer().iter().all(|&w| w == ERASED_WORD));
        assert!(boot.nvm.commits.is_empty());

        assert_eq!(boot.exit(), ExitAction::Halt);
        assert!(boot.nvm.is_spm_locked());
    }

    #[test]
    fn test_full_page_commits_once() {
        let mut lines: Vec<String> = (0..32u16)
            .map(|i| encode_record(0x00, i * 16, &[i as u8; 16]))
            .collect();
        lines.push(eof());
        let mut boot = device_with(config(), &lines);
        boot.init().unwrap();
        boot.enter().unwrap();

        assert_eq!(boot.nvm.commits, vec![0]);
        assert_eq!(boot.pages_written(), 1);
        assert_eq!(boot.nvm.mem.page(0)[511], 31);
    }

    #[test]
    fn test_page_change_commits_padded_page() {
        let lines = [
            encode_record(0x00, 0x0000, &[0xAA; 4]),
            encode_record(0x00, 0x0200, &[0xBB; 4]),
            eof(),
        ];
        let mut boot = device_with(config(), &lines);
        boot.init().unwrap();
        boot.enter().unwrap();
        assert_eq!(boot.nvm.commits, vec![0, 1]);
        assert_eq!(&boot.nvm.mem.page(0)[..5], &[0xAA, 0xAA, 0xAA, 0xAA, 0xFF]);
        assert_eq!(&boot.nvm.mem.page(1)[..5], &[0xBB, 0xBB, 0xBB, 0xBB, 0xFF]);
    }

    #[test]
    fn test_protected_region_rejected() {
        let cfg = BootloaderConfig {
            layout: FlashLayout::XMEGA128A1.with_app_start(0x10000),
            ..config()
        };
        let mut boot = device_with(cfg.clone(), &[encode_record(0x00, 0, &[0; 2]), eof()]);
        boot.init().unwrap();
        assert_eq!(boot.enter(), Err(BootError::Nvm(NvmError::AddressOutOfRange { address: 0 })));
        assert_eq!(boot.exit(), ExitAction::Halt);

        let lines = [
            encode_record(0x04, 0, &[0x00, 0x01]),
            encode_record(0x00, 0, &[0x0C, 0x94]),
            eof(),
        ];
        let mut boot = device_with(cfg, &lines);
        boot.init().unwrap();
        boot.enter().unwrap();
        assert_eq!(boot.nvm.commits, vec![0x10000 / 512]);
        assert_eq!(boot.nvm.mem.read_program_word(0x8000), 0x940C);
        assert_eq!(boot.exit(), ExitAction::JumpToApplication { entry: 0x10000 });
    }

    #[test]
    fn test_boot_section_rejected() {
        let lines = [encode_record(0x04, 0, &[0x00, 0x02]), encode_record(0x00, 0, &[0; 2]), eof()];
        let mut boot = device_with(config(), &lines);
        boot.init().unwrap();
        assert_eq!(
            boot.enter(),
            Err(BootError::Nvm(NvmError::AddressOutOfRange { address: 0x20000 }))
        );
    }

    #[test]
    fn test_flash_failure_aborts() {
        let mut boot = device_with(config(), &[encode_record(0x00, 0, &[1, 2, 3, 4]), eof()]);
        boot.nvm.fail_pages.push(0);
        boot.init().unwrap();
        assert_eq!(boot.enter(), Err(BootError::Nvm(NvmError::FlashWriteFailure { page: 0 })));
        assert_eq!(boot.state(), SessionState::Error);
        assert_eq!(boot.exit(), ExitAction::Halt);
    }

    #[test]
    fn test_silent_host_times_out() {
        let mut boot = Bootloader::simulated(config()).unwrap();
        boot.host_send(b":1000");
        boot.init().unwrap();
        assert_eq!(
            boot.enter(),
            Err(BootError::Transport(TransportError::Timeout { polls: 1_000 }))
        );
        assert_eq!(boot.exit(), ExitAction::Halt);
    }

    #[test]
    fn test_odd_data_address_rejected() {
        let mut boot = device_with(config(), &[encode_record(0x00, 1, &[1, 2]), eof()]);
        boot.init().unwrap();
        assert_eq!(
            boot.enter(),
            Err(BootError::Hex(HexError::MalformedRecord("odd data address")))
        );
    }

    #[test]
    fn test_start_address_records_set_entry() {
        let lines = [encode_record(0x05, 0, &[0x00, 0x00, 0x01, 0x00]), eof()];
        let mut boot = device_with(config(), &lines);
        assert_eq!(boot.run(), ExitAction::JumpToApplication { entry: 0x100 });

        let lines = [encode_record(0x03, 0, &[0x00, 0x10, 0x00, 0x04]), eof()];
        let mut boot = device_with(config(), &lines);
        assert_eq!(boot.run(), ExitAction::JumpToApplication { entry: 0x104 });
    }

    #[test]
    fn test_noise_between_lines_ignored() {
        let data = [0x12, 0x34];
        let mut boot = Bootloader::simulated(config()).unwrap();
        let mut bytes = b"junk\n".to_vec();
        bytes.extend(stream(&[encode_record(0x00, 0, &data).to_lowercase(), eof()]));
        boot.host_send(&bytes);
        boot.init().unwrap();
        boot.enter().unwrap();
        assert_eq!(boot.nvm.mem.read_program_word(0), 0x3412);
    }

    #[test]
    fn test_enter_requires_init() {
        let mut boot = Bootloader::simulated(config()).unwrap();
        assert_eq!(boot.enter(), Err(BootError::InvalidState("uninitialized")));
        assert_eq!(boot.exit(), ExitAction::Halt);
        assert!(boot.nvm.is_spm_locked());
    }

    #[test]
    fn test_locked_after_exit() {
        let mut boot = device_with(config(), &[eof()]);
        boot.run();
        boot.host_send(&stream(&[encode_record(0x00, 0, &[0; 16]), eof()]));
        assert_eq!(boot.init(), Err(BootError::InvalidState("SPM locked")));
        assert_eq!(boot.enter(), Err(BootError::InvalidState("uninitialized")));
        assert_eq!(boot.exit(), ExitAction::Halt);
        assert!(boot.nvm.commits.is_empty());
        assert_eq!(boot.nvm.erase_count, 1);
    }

    #[test]
    fn test_power_cycle_allows_new_session() {
        let mut boot = device_with(config(), &[eof()]);
        boot.run();
        boot.power_cycle();
        assert!(!boot.nvm.is_spm_locked());
        assert!(!boot.io.bus.usart(E0).unwrap().tx_enabled());

        boot.host_send(&stream(&[encode_record(0x00, 0, &[0x5A; 16]), eof()]));
        assert_eq!(boot.run(), ExitAction::JumpToApplication { entry: 0 });
        assert_eq!(boot.nvm.commits, vec![0]);
        assert_eq!(boot.nvm.mem.flash[15], 0x5A);
    }

    #[test]
    fn test_revisiting_committed_page_aborts() {
        let lines = [
            encode_record(0x00, 0x0000, &[0xAA; 16]),
            encode_record(0x00, 0x0200, &[0xBB; 16]),
            encode_record(0x00, 0x0010, &[0xCC; 16]),
            eof(),
        ];
        let mut boot = device_with(config(), &lines);
        boot.init().unwrap();
        assert_eq!(boot.enter(), Err(BootError::Nvm(NvmError::PageRewrite { page: 0 })));
        assert_eq!(boot.state(), SessionState::Error);
        assert_eq!(boot.nvm.commits, vec![0]);
        assert_eq!(&boot.nvm.mem.page(0)[..4], &[0xAA; 4]);
        assert_eq!(boot.exit(), ExitAction::Halt);
    }

    #[test]
    fn test_rejects_instance_without_usart() {
        let cfg = BootloaderConfig {
            interface: UsartInstance { port: PortId::A, index: 0 },
            ..config()
        };
        assert!(matches!(Bootloader::simulated(cfg), Err(ConfigError::NoUsart(_))));
    }
}
