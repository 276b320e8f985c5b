//! XMega bootloader host tool.
//!
//! Provides three commands:
//!
//! - **sim**: runs the bootloader against a simulated ATxmega128A1 and
//!   prints what the device sent. The device flash can be kept between
//!   runs in a state file (`--state`).
//! - **upload**: sends an image to a real device over a serial port,
//!   pacing lines on the device's XON.
//! - **verify**: compares a saved device state with an image.
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

mod sim;
mod upload;

use anyhow::{self as ah, Context as _};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xmega_boot_core::hex;
use xmega_boot_core::memory::ERASED;
use xmega_boot_core::savestate;

#[derive(Parser, Debug)]
#[command(name = "xmega-boot", version, about = "XMega USART bootloader host tool")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bootloader on a simulated device
    Sim {
        /// Intel-HEX image to transfer
        image: PathBuf,
        /// Bootloader configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Device state file, loaded if present and saved afterwards
        #[arg(long)]
        state: Option<PathBuf>,
        /// Write the application section to this binary file
        #[arg(long)]
        dump: Option<PathBuf>,
        /// Status polls per byte before the device gives up
        #[arg(long)]
        poll_limit: Option<u32>,
    },
    /// Upload an image to a device over a serial port
    Upload {
        image: PathBuf,
        /// Serial port, e.g. /dev/ttyUSB0
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = 19_200)]
        baud: u32,
        /// How long to wait for the handshake and for each XON
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Compare a saved device state with an image
    Verify {
        image: PathBuf,
        #[arg(long)]
        state: PathBuf,
    },
}

fn main() -> ah::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();

    match opts.command {
        Command::Sim { image, config, state, dump, poll_limit } => sim::run(&sim::SimOpts {
            image,
            config,
            state,
            dump,
            poll_limit,
        }),
        Command::Upload { image, port, baud, timeout_ms } => {
            upload::run(&image, &port, baud, Duration::from_millis(timeout_ms))
        }
        Command::Verify { image, state } => verify(&image, &state),
    }
}

fn verify(image: &Path, state: &Path) -> ah::Result<()> {
    let text = std::fs::read_to_string(image)
        .with_context(|| format!("Read image {}", image.display()))?;
    let device = savestate::load_from_file(state)
        .with_context(|| format!("Load device state {}", state.display()))?;

    let mut expected = vec![ERASED; device.layout.flash_size as usize];
    hex::parse_hex(&text, &mut expected).context("Decode image")?;

    let start = device.layout.app_start as usize;
    let end = device.layout.boot_start as usize;
    let mismatches: Vec<usize> = (start..end)
        .filter(|&addr| expected[addr] != device.flash[addr])
        .collect();

    if let Some(&first) = mismatches.first() {
        ah::bail!(
            "{} byte(s) differ, first at 0x{:05X} (image 0x{:02X}, device 0x{:02X})",
            mismatches.len(),
            first,
            expected[first],
            device.flash[first]
        );
    }
    println!(
        "Verified 0x{:05X}..0x{:05X} against {}",
        start,
        end,
        image.display()
    );
    Ok(())
}
