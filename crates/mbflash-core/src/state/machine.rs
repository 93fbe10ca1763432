//! Phases and runtime state of an update run.

use std::fmt;

/// Update run phases.
///
/// `Idle → Decoding → Assembling → (VerifyCounter → [WatchdogReset] →
/// FillPage → CommitPage → Advance)* → Reboot → Done`; `Aborted` is reachable
/// from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Decoding,
    Assembling,
    VerifyCounter,
    WatchdogReset,
    FillPage,
    CommitPage,
    Advance,
    Reboot,
    Done,
    Aborted,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "IDLE"),
            UpdatePhase::Decoding => write!(f, "DECODING"),
            UpdatePhase::Assembling => write!(f, "ASSEMBLING"),
            UpdatePhase::VerifyCounter => write!(f, "VERIFY_COUNTER"),
            UpdatePhase::WatchdogReset => write!(f, "WATCHDOG_RESET"),
            UpdatePhase::FillPage => write!(f, "FILL_PAGE"),
            UpdatePhase::CommitPage => write!(f, "COMMIT_PAGE"),
            UpdatePhase::Advance => write!(f, "ADVANCE"),
            UpdatePhase::Reboot => write!(f, "REBOOT"),
            UpdatePhase::Done => write!(f, "DONE"),
            UpdatePhase::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Runtime state of one run.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Current phase.
    pub phase: UpdatePhase,
    /// Page index the device counter must report next.
    pub expected_page_counter: usize,
    /// Pages in the image.
    pub total_pages: usize,
    /// Payload bytes committed so far.
    pub bytes_flashed: usize,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new phase.
    pub fn goto_phase(&mut self, new_phase: UpdatePhase) {
        tracing::debug!(from = %self.phase, to = %new_phase, "Phase transition");
        self.phase = new_phase;
    }

    /// Count one committed page.
    pub fn advance(&mut self, page_bytes: usize) {
        self.expected_page_counter += 1;
        self.bytes_flashed += page_bytes;
    }

    pub fn is_complete(&self) -> bool {
        self.expected_page_counter >= self.total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_accounting() {
        let mut state = SessionState::new();
        state.total_pages = 2;
        assert_eq!(state.phase, UpdatePhase::Idle);

        state.advance(128);
        assert!(!state.is_complete());

        state.advance(128);
        assert!(state.is_complete());
        assert_eq!(state.expected_page_counter, 2);
        assert_eq!(state.bytes_flashed, 256);
    }

    #[test]
    fn test_phase_display() {
        let mut state = SessionState::new();
        state.goto_phase(UpdatePhase::FillPage);
        assert_eq!(state.phase, UpdatePhase::FillPage);
        assert_eq!(UpdatePhase::VerifyCounter.to_string(), "VERIFY_COUNTER");
    }
}
