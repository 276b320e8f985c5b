//! `upload` command: send an image to a device over a serial port.
//!
//! The device sends `'A'` once it is ready, then `XOFF` when a line is
//! complete and `XON` once it has been programmed. A line the device
//! rejects never gets its `XON`, so the upload stops at the timeout.

use anyhow::{self as ah, Context as _};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use xmega_boot_core::peripherals::BaudRate;
use xmega_boot_core::{HANDSHAKE, XOFF, XON};

/// Time to collect the leave message after the last line.
const DRAIN_TIME: Duration = Duration::from_millis(300);

pub fn run(image: &Path, port: &str, baud: u32, timeout: Duration) -> ah::Result<()> {
    let baud = BaudRate::try_from(baud)?;
    let text = std::fs::read_to_string(image)
        .with_context(|| format!("Read image {}", image.display()))?;
    let lines = records(&text);
    ah::ensure!(!lines.is_empty(), "{} holds no records", image.display());

    let mut serial = serialport::new(port, baud.bits_per_second())
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(50))
        .open()
        .with_context(|| format!("Open serial port {}", port))?;

    let mut console = Vec::new();
    wait_for(&mut serial, HANDSHAKE, timeout, &mut console).context("Waiting for handshake")?;
    info!(port, baud = baud.bits_per_second(), lines = lines.len(), "device ready");

    for (n, line) in lines.iter().enumerate() {
        serial.write_all(line.as_bytes()).context("Serial port write")?;
        serial.write_all(b"\r\n").context("Serial port write")?;
        wait_for(&mut serial, XON, timeout, &mut console)
            .with_context(|| format!("Line {} rejected or device silent: {}", n + 1, line))?;
        debug!(line = n + 1, "acknowledged");
    }

    drain(&mut serial, DRAIN_TIME, &mut console);
    print!("{}", String::from_utf8_lossy(&console));
    info!(lines = lines.len(), "upload complete");
    Ok(())
}

/// Record lines of a HEX file.
fn records(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).filter(|l| l.starts_with(':')).collect()
}

/// Read until `wanted` arrives. Other bytes except `XOFF` go to `console`.
fn wait_for<R: Read>(port: &mut R, wanted: u8, timeout: Duration, console: &mut Vec<u8>) -> ah::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut byte = [0u8; 1];
    while Instant::now() < deadline {
        match port.read(&mut byte) {
            Ok(1) if byte[0] == wanted => return Ok(()),
            Ok(1) if byte[0] == XOFF => {}
            Ok(1) => console.push(byte[0]),
            Ok(_) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e).context("Serial port read"),
        }
    }
    ah::bail!("timed out after {} ms waiting for 0x{:02X}", timeout.as_millis(), wanted)
}

fn drain<R: Read>(port: &mut R, time: Duration, console: &mut Vec<u8>) {
    let deadline = Instant::now() + time;
    let mut buf = [0u8; 64];
    while Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => console.extend(buf[..n].iter().filter(|&&b| b != XON && b != XOFF)),
            Err(_) => break,
        }
    }
}
