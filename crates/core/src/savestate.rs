//! Persisted state of the simulated device.
//!
//! Lets the host tool keep a simulated device's flash between runs (and
//! verify it later) using bincode serialization with deflate compression.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "XBDS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StateFileError;
use crate::memory::FlashLayout;
use crate::nvm::{Nvm, SimNvm};

/// Magic bytes identifying a device state file.
const MAGIC: &[u8; 4] = b"XBDS";
/// Current device state format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub layout: FlashLayout,
    pub flash: Vec<u8>,
    pub spm_locked: bool,
    /// Pages committed over the device lifetime
    pub total_commits: u64,
    /// Application section erases over the device lifetime
    pub erase_count: u32,
}

impl DeviceState {
    pub fn from_nvm(nvm: &SimNvm) -> Self {
        DeviceState {
            layout: nvm.layout(),
            flash: nvm.mem.flash.clone(),
            spm_locked: nvm.is_spm_locked(),
            total_commits: nvm.total_commits,
            erase_count: nvm.erase_count,
        }
    }

    /// Application section bytes.
    pub fn application(&self) -> &[u8] {
        let start = self.layout.app_start as usize;
        let end = (self.layout.boot_start as usize).min(self.flash.len());
        self.flash.get(start..end).unwrap_or(&[])
    }

    /// Load into `nvm`. The flash image must match the NVM's layout.
    ///
    /// The lock flag is restored as saved; a power cycle through
    /// [`SimNvm::reset`] clears it.
    pub fn apply_to(self, nvm: &mut SimNvm) -> Result<(), StateFileError> {
        if self.layout != nvm.layout() {
            return Err(StateFileError::LayoutMismatch);
        }
        let expected = self.layout.flash_size as usize;
        if self.flash.len() != expected {
            return Err(StateFileError::SizeMismatch { found: self.flash.len(), expected });
        }
        nvm.restore(self.flash, self.spm_locked, self.total_commits, self.erase_count);
        Ok(())
    }
}

/// Save state to file with header and deflate compression.
pub fn save_to_file(state: &DeviceState, path: &Path) -> Result<(), StateFileError> {
    let payload = bincode::serialize(state)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);

    std::fs::write(path, &out)?;
    Ok(())
}

/// Load state from file, verifying magic and version.
pub fn load_from_file(path: &Path) -> Result<DeviceState, StateFileError> {
    let data = std::fs::read(path)?;

    if data.len() < HEADER_LEN {
        return Err(StateFileError::TooSmall);
    }
    if &data[0..4] != MAGIC {
        return Err(StateFileError::BadMagic);
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(StateFileError::Version { found: version, expected: FORMAT_VERSION });
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| StateFileError::Decompress(format!("{:?}", e)))?;

    let state: DeviceState = bincode::deserialize(&decompressed)?;
    state.layout.validate()?;
    let expected = state.layout.flash_size as usize;
    if state.flash.len() != expected {
        return Err(StateFileError::SizeMismatch { found: state.flash.len(), expected });
    }
    Ok(state)
}
