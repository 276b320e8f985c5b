//! Bootloader session state.

use tracing::{debug, info, warn};

use crate::error::BootError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not transferring; after reset or `exit`
    Idle,
    /// Waiting for and parsing records
    Receiving,
    /// Programming the NVM page buffer or committing a page
    Flashing,
    /// EOF record applied, image complete
    Done,
    /// Transfer aborted; the image must not be started
    Error,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Receiving => "Receiving",
            SessionState::Flashing => "Flashing",
            SessionState::Done => "Done",
            SessionState::Error => "Error",
        }
    }

    fn allows(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Receiving)
                | (Receiving, Flashing)
                | (Flashing, Receiving)
                | (Flashing, Done)
                | (Receiving, Error)
                | (Flashing, Error)
                | (Done, Idle)
                | (Error, Idle)
        )
    }
}

/// Where control goes after `exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Start the application at this byte address (`IJMP` to `entry / 2`).
    JumpToApplication { entry: u32 },
    /// Stay in the bootloader; the application image is not trusted.
    Halt,
}

/// State plus per-session statistics.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    /// Every state entered, starting with `Idle`
    pub history: Vec<SessionState>,
    /// Records accepted
    pub records: u32,
    /// Data bytes accepted
    pub data_bytes: u32,
    /// Why the session entered `Error`
    pub error: Option<BootError>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            records: 0,
            data_bytes: 0,
            error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Transitions the state machine does not have are
    /// refused with `InvalidState`.
    pub fn transition(&mut self, next: SessionState) -> Result<(), BootError> {
        if !self.state.allows(next) {
            return Err(BootError::InvalidState(self.state.name()));
        }
        if next == SessionState::Flashing || self.state == SessionState::Flashing {
            debug!(from = self.state.name(), to = next.name(), "session");
        } else {
            info!(from = self.state.name(), to = next.name(), "session");
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Enter `Error` from any active state and remember the cause.
    pub fn fail(&mut self, err: BootError) {
        warn!(state = self.state.name(), error = %err, "session failed");
        if self.state.allows(SessionState::Error) {
            self.state = SessionState::Error;
            self.history.push(SessionState::Error);
        }
        self.error = Some(err);
    }

    /// Back to `Idle`. Statistics and history stay readable until the next session.
    pub fn close(&mut self) {
        if self.state != SessionState::Idle {
            info!(from = self.state.name(), to = "Idle", "session");
            self.state = SessionState::Idle;
            self.history.push(SessionState::Idle);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
