//! NVM self-programming.
//!
//! The XMega NVM controller owns a hardware page buffer. Words are loaded
//! into it with the LOAD_FLASH_BUFFER command and committed with
//! ERASE_WRITE_APP_PAGE. [`Nvm`] is that command set; [`SimNvm`] is the
//! host model behind it. [`PageWriter`] decides when a page is full and
//! must be committed.

use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::error::NvmError;
use crate::memory::{FlashLayout, FlashMemory, ERASED_WORD};

/// NVM commands as written to NVM.CMD.
pub mod cmd {
    pub const NO_OPERATION: u8 = 0x00;
    pub const ERASE_APP: u8 = 0x20;
    pub const LOAD_FLASH_BUFFER: u8 = 0x23;
    pub const ERASE_WRITE_APP_PAGE: u8 = 0x25;
    pub const ERASE_FLASH_BUFFER: u8 = 0x26;
}

/// Device self-programming interface.
#[cfg_attr(test, mockall::automock)]
pub trait Nvm {
    /// Erase the whole application section.
    fn erase_application(&mut self);
    /// Reset the page buffer to the erased value.
    fn clear_flash_buffer(&mut self);
    /// Stage one word at `word_offset` within the page buffer.
    fn load_flash_buffer(&mut self, word_offset: u16, word: u16);
    /// Erase-write the page buffer into `page` and clear the buffer.
    fn flush_flash(&mut self, page: u32) -> Result<(), NvmError>;
    /// Disable SPM until the next reset.
    fn lock_spm(&mut self);
    fn is_spm_locked(&self) -> bool;
}

/// Host model of the NVM controller and flash array.
pub struct SimNvm {
    pub mem: FlashMemory,
    page_buffer: Vec<u16>,
    spm_locked: bool,
    /// Last command executed, mirrors NVM.CMD
    pub last_cmd: u8,
    /// Pages committed since power-up, in order
    pub commits: Vec<u32>,
    /// Pages committed over the device lifetime
    pub total_commits: u64,
    pub erase_count: u32,
    /// Pages whose erase-write reports failure
    pub fail_pages: Vec<u32>,
}

impl SimNvm {
    pub fn new(layout: FlashLayout) -> Self {
        SimNvm {
            mem: FlashMemory::new(layout),
            page_buffer: vec![ERASED_WORD; layout.page_words()],
            spm_locked: false,
            last_cmd: cmd::NO_OPERATION,
            commits: Vec::new(),
            total_commits: 0,
            erase_count: 0,
            fail_pages: Vec::new(),
        }
    }

    pub fn page_buffer(&self) -> &[u16] {
        &self.page_buffer
    }

    pub fn layout(&self) -> FlashLayout {
        self.mem.layout
    }

    /// Restore a previously saved device.
    pub fn restore(&mut self, flash: Vec<u8>, spm_locked: bool, total_commits: u64, erase_count: u32) {
        self.mem.flash = flash;
        self.spm_locked = spm_locked;
        self.commits.clear();
        self.total_commits = total_commits;
        self.erase_count = erase_count;
        self.page_buffer.fill(ERASED_WORD);
    }

    /// Power cycle: SPM lock and page buffer are volatile.
    pub fn reset(&mut self) {
        self.spm_locked = false;
        self.page_buffer.fill(ERASED_WORD);
        self.last_cmd = cmd::NO_OPERATION;
    }

    fn locked(&self, what: &str) -> bool {
        if self.spm_locked {
            warn!(operation = what, "SPM locked, ignoring");
        }
        self.spm_locked
    }
}

impl Nvm for SimNvm {
    fn erase_application(&mut self) {
        if self.locked("erase_application") { return; }
        self.last_cmd = cmd::ERASE_APP;
        self.mem.erase_application();
        self.erase_count += 1;
    }

    fn clear_flash_buffer(&mut self) {
        if self.locked("clear_flash_buffer") { return; }
        self.last_cmd = cmd::ERASE_FLASH_BUFFER;
        self.page_buffer.fill(ERASED_WORD);
    }

    fn load_flash_buffer(&mut self, word_offset: u16, word: u16) {
        if self.locked("load_flash_buffer") { return; }
        self.last_cmd = cmd::LOAD_FLASH_BUFFER;
        // Hardware ignores address bits above the page
        let idx = word_offset as usize % self.page_buffer.len();
        self.page_buffer[idx] = word;
    }

    fn flush_flash(&mut self, page: u32) -> Result<(), NvmError> {
        if self.locked("flush_flash") { return Ok(()); }
        self.last_cmd = cmd::ERASE_WRITE_APP_PAGE;
        if self.fail_pages.contains(&page) || !self.mem.write_page(page, &self.page_buffer) {
            return Err(NvmError::FlashWriteFailure { page });
        }
        self.commits.push(page);
        self.total_commits += 1;
        self.page_buffer.fill(ERASED_WORD);
        Ok(())
    }

    fn lock_spm(&mut self) {
        self.spm_locked = true;
    }

    fn is_spm_locked(&self) -> bool {
        self.spm_locked
    }
}

/// Accumulates words for one page and commits only full pages.
pub struct PageWriter {
    layout: FlashLayout,
    /// Page currently staged in the NVM page buffer
    page: Option<u32>,
    loaded: Vec<bool>,
    count: usize,
    /// Pages already erase-written, which must not be touched again
    committed: BTreeSet<u32>,
    /// Pages committed through this writer
    pub pages_written: u32,
}

impl PageWriter {
    pub fn new(layout: FlashLayout) -> Self {
        PageWriter {
            layout,
            page: None,
            loaded: vec![false; layout.page_words()],
            count: 0,
            committed: BTreeSet::new(),
            pages_written: 0,
        }
    }

    pub fn layout(&self) -> FlashLayout {
        self.layout
    }

    /// Page being staged, if any words are pending.
    pub fn pending_page(&self) -> Option<u32> {
        self.page
    }

    /// Number of distinct words staged for the pending page.
    pub fn pending_words(&self) -> usize {
        self.count
    }

    /// Forget staged words without committing.
    pub fn discard(&mut self) {
        self.page = None;
        self.loaded.fill(false);
        self.count = 0;
    }

    /// Stage a run of bytes starting at an even absolute address.
    ///
    /// The whole range is checked against the application section and the
    /// pages already committed before anything is loaded. An odd trailing byte is paired with 0xFF.
    pub fn load_bytes<N: Nvm + ?Sized>(&mut self, nvm: &mut N, address: u32, data: &[u8]) -> Result<(), NvmError> {
        self.layout.check_app_range(address, data.len() as u32)?;
        if let Some(last) = data.len().checked_sub(1) {
            let pages = self.layout.page_of(address)..=self.layout.page_of(address + last as u32);
            if let Some(&page) = self.committed.range(pages).next() {
                return Err(NvmError::PageRewrite { page });
            }
        }
        for (i, pair) in data.chunks(2).enumerate() {
            let lo = pair[0];
            let hi = pair.get(1).copied().unwrap_or(0xFF);
            self.load_word(nvm, address + 2 * i as u32, u16::from_le_bytes([lo, hi]))?;
        }
        Ok(())
    }

    /// Stage one word at an even absolute byte address, committing the
    /// page once every slot has been loaded.
    ///
    /// A page is erase-written as a whole, so a word for a page that has
    /// already been committed is refused.
    pub fn load_word<N: Nvm + ?Sized>(&mut self, nvm: &mut N, address: u32, word: u16) -> Result<(), NvmError> {
        self.layout.check_app_range(address, 2)?;
        let page = self.layout.page_of(address);
        if self.committed.contains(&page) {
            return Err(NvmError::PageRewrite { page });
        }

        if let Some(current) = self.page {
            if current != page {
                self.complete(nvm)?;
            }
        }
        self.page = Some(page);

        let offset = self.layout.word_offset(address);
        nvm.load_flash_buffer(offset, word);
        let slot = &mut self.loaded[offset as usize];
        if !*slot {
            *slot = true;
            self.count += 1;
        }

        if self.count == self.loaded.len() {
            self.flush(nvm, page)?;
        }
        Ok(())
    }

    /// Complete and commit the pending page, if any.
    pub fn finish<N: Nvm + ?Sized>(&mut self, nvm: &mut N) -> Result<(), NvmError> {
        if self.page.is_some() {
            self.complete(nvm)?;
        }
        Ok(())
    }

    /// Fill unloaded slots with the erased value and commit.
    fn complete<N: Nvm + ?Sized>(&mut self, nvm: &mut N) -> Result<(), NvmError> {
        let Some(page) = self.page else { return Ok(()) };
        for (offset, slot) in self.loaded.iter_mut().enumerate() {
            if !*slot {
                nvm.load_flash_buffer(offset as u16, ERASED_WORD);
                *slot = true;
            }
        }
        self.count = self.loaded.len();
        self.flush(nvm, page)
    }

    fn flush<N: Nvm + ?Sized>(&mut self, nvm: &mut N, page: u32) -> Result<(), NvmError> {
        let result = nvm.flush_flash(page);
        self.discard();
        result?;
        self.committed.insert(page);
        self.pages_written += 1;
        info!(page, address = page * self.layout.page_size, "page committed");
        Ok(())
    }
}
