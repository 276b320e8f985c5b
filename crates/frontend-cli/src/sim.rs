//! `sim` command: the bootloader on a simulated device.

use anyhow::{self as ah, Context as _};
use std::path::PathBuf;
use tracing::info;
use xmega_boot_core::savestate::{self, DeviceState};
use xmega_boot_core::{Bootloader, BootloaderConfig, ExitAction, XOFF, XON};

/// Poll limit when neither the config nor the command line sets one, so
/// a truncated image ends the run instead of hanging it.
const DEFAULT_POLL_LIMIT: u32 = 100_000;

pub struct SimOpts {
    pub image: PathBuf,
    pub config: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub dump: Option<PathBuf>,
    pub poll_limit: Option<u32>,
}

pub fn run(opts: &SimOpts) -> ah::Result<()> {
    let mut cfg = match &opts.config {
        Some(path) => BootloaderConfig::load(path)
            .with_context(|| format!("Load config {}", path.display()))?,
        None => BootloaderConfig::default(),
    };
    cfg.poll_limit = opts.poll_limit.or(cfg.poll_limit).or(Some(DEFAULT_POLL_LIMIT));

    let text = std::fs::read_to_string(&opts.image)
        .with_context(|| format!("Read image {}", opts.image.display()))?;

    let mut boot = Bootloader::simulated(cfg).context("Configure bootloader")?;

    if let Some(path) = opts.state.as_deref().filter(|p| p.exists()) {
        let state = savestate::load_from_file(path)
            .with_context(|| format!("Load device state {}", path.display()))?;
        state.apply_to(&mut boot.nvm).context("Restore device state")?;
        // Power-on: the SPM lock does not survive a reset
        boot.power_cycle();
        info!(path = %path.display(), "device state loaded");
    }

    boot.host_send(&line_stream(&text));
    let result = match boot.init() {
        Ok(()) => boot.enter(),
        Err(err) => Err(err),
    };
    let final_state = boot.state();
    let action = boot.exit();

    print_console(boot.console());
    println!("State:   {}", final_state.name());
    println!("Records: {} ({} data bytes)", boot.session.records, boot.session.data_bytes);
    println!("Pages:   {} committed", boot.nvm.commits.len());
    match action {
        ExitAction::JumpToApplication { entry } => println!("Exit:    jump to 0x{:05X}", entry),
        ExitAction::Halt => println!("Exit:    halt"),
    }

    if let Some(path) = &opts.state {
        savestate::save_to_file(&DeviceState::from_nvm(&boot.nvm), path)
            .with_context(|| format!("Save device state {}", path.display()))?;
        info!(path = %path.display(), "device state saved");
    }

    if let Some(path) = &opts.dump {
        std::fs::write(path, boot.nvm.mem.application())
            .with_context(|| format!("Write dump {}", path.display()))?;
    }

    result.context("Transfer failed")?;
    Ok(())
}

/// HEX text as the host sends it: one record per line, CR LF terminated.
fn line_stream(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + text.len() / 16);
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Print the device's console text, with flow control bytes left out.
fn print_console(tx: &[u8]) {
    let text: Vec<u8> = tx.iter().copied().filter(|&b| b != XON && b != XOFF).collect();
    println!("Console:");
    for line in String::from_utf8_lossy(&text).split(['\n', '\r']).filter(|l| !l.is_empty()) {
        println!("  {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_stream_normalizes_endings() {
        let text = ":00000001FF\n\n  :00000001FF  \r\n";
        assert_eq!(line_stream(text), b":00000001FF\r\n:00000001FF\r\n".to_vec());
    }

    #[test]
    fn test_sim_round_trip_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.hex");
        let state = dir.path().join("app.state");
        let dump = dir.path().join("app.bin");
        std::fs::write(&image, ":0400000001020304F2\n:00000001FF\n").unwrap();

        let opts = SimOpts {
            image: image.clone(),
            config: None,
            state: Some(state.clone()),
            dump: Some(dump.clone()),
            poll_limit: Some(1_000),
        };
        run(&opts).unwrap();
        // Second run starts from the saved flash and reprograms it
        run(&opts).unwrap();

        let saved = savestate::load_from_file(&state).unwrap();
        assert_eq!(&saved.application()[..5], &[1, 2, 3, 4, 0xFF]);
        assert_eq!(saved.total_commits, 2);
        assert_eq!(saved.erase_count, 2);
        assert_eq!(&std::fs::read(&dump).unwrap()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_sim_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("bad.hex");
        std::fs::write(&image, ":0400000001020304F3\n:00000001FF\n").unwrap();
        let opts = SimOpts { image, config: None, state: None, dump: None, poll_limit: Some(1_000) };
        let err = run(&opts).unwrap_err();
        assert!(format!("{:#}", err).contains("checksum"), "{:#}", err);
    }
}
