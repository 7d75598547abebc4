// Scheduler run phases and the scanning decision

use serde::Serialize;
use std::fmt;

/// Phase of a plan run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Scanning,
    Dispatching,
    Awaiting,
    BlockedTerminal,
    Archiving,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Scanning => "scanning",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Awaiting => "awaiting",
            RunPhase::BlockedTerminal => "blocked-terminal",
            RunPhase::Archiving => "archiving",
        };
        write!(f, "{}", name)
    }
}

/// What a scan observed
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanView {
    /// Every step is complete or blocked
    pub all_terminal: bool,
    /// Every step is complete
    pub successful: bool,
    /// Something can be started right now
    pub dispatchable: bool,
    /// Worker invocations still running
    pub in_flight: usize,
    /// Keep an all-terminal plan with blocked steps unarchived
    pub hold_blocked: bool,
}

/// Where to go after `scanning`
pub fn after_scanning(view: ScanView) -> RunPhase {
    if view.dispatchable {
        return RunPhase::Dispatching;
    }
    if view.in_flight > 0 {
        return RunPhase::Awaiting;
    }
    // Blocked-terminal only when pending steps can never become ready
    if view.all_terminal && (view.successful || !view.hold_blocked) {
        RunPhase::Archiving
    } else {
        RunPhase::BlockedTerminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_wins_over_waiting() {
        let view = ScanView {
            dispatchable: true,
            in_flight: 2,
            ..Default::default()
        };
        assert_eq!(after_scanning(view), RunPhase::Dispatching);
    }

    #[test]
    fn test_waits_while_workers_run() {
        let view = ScanView {
            in_flight: 1,
            ..Default::default()
        };
        assert_eq!(after_scanning(view), RunPhase::Awaiting);
    }

    #[test]
    fn test_nothing_ready_nothing_running_is_terminal() {
        assert_eq!(after_scanning(ScanView::default()), RunPhase::BlockedTerminal);
    }

    #[test]
    fn test_complete_plan_archives() {
        let view = ScanView {
            all_terminal: true,
            successful: true,
            ..Default::default()
        };
        assert_eq!(after_scanning(view), RunPhase::Archiving);
    }

    #[test]
    fn test_all_terminal_plan_with_blocked_steps_archives() {
        let mut view = ScanView {
            all_terminal: true,
            successful: false,
            ..Default::default()
        };
        assert_eq!(after_scanning(view), RunPhase::Archiving);

        view.hold_blocked = true;
        assert_eq!(after_scanning(view), RunPhase::BlockedTerminal);
    }

    #[test]
    fn test_unreachable_pending_steps_are_terminal_even_when_archiving_blocked() {
        let view = ScanView {
            all_terminal: false,
            successful: false,
            ..Default::default()
        };
        assert_eq!(after_scanning(view), RunPhase::BlockedTerminal);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RunPhase::BlockedTerminal.to_string(), "blocked-terminal");
    }
}
