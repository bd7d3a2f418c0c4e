//! Session lifecycle phases

use serde::{Deserialize, Serialize};

/// Lifecycle of one device within a session.
///
/// `Aborted` and `SessionEnded` are reachable from every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    RoleNegotiation,
    Calibrating,
    Armed,
    RunInProgress,
    ResultPending,
    Idle,
    Aborted,
    SessionEnded,
}

impl SessionPhase {
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        use SessionPhase::*;

        if matches!(next, Aborted | SessionEnded | Disconnected) {
            return *self != SessionEnded;
        }
        matches!(
            (*self, next),
            (Disconnected, Connecting)
                | (Connecting, RoleNegotiation)
                | (RoleNegotiation, Calibrating)
                | (Calibrating, Armed)
                | (Calibrating, Idle)
                | (Armed, RunInProgress)
                | (Armed, Idle)
                | (Armed, Calibrating)
                | (RunInProgress, ResultPending)
                | (RunInProgress, Idle)
                | (ResultPending, Idle)
                | (Idle, Armed)
                | (Idle, Calibrating)
                | (Aborted, Idle)
                | (Aborted, Calibrating)
        )
    }

    /// A run is underway.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionPhase::RunInProgress | SessionPhase::ResultPending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::SessionEnded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_loop() {
        use SessionPhase::*;
        let path = [
            Disconnected,
            Connecting,
            RoleNegotiation,
            Calibrating,
            Armed,
            RunInProgress,
            ResultPending,
            Idle,
            Armed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_abort_from_anywhere_but_ended() {
        use SessionPhase::*;
        for phase in [Connecting, Armed, RunInProgress, Idle, Aborted] {
            assert!(phase.can_transition_to(Aborted));
            assert!(phase.can_transition_to(SessionEnded));
        }
        assert!(!SessionEnded.can_transition_to(Aborted));
        assert!(!SessionEnded.can_transition_to(Idle));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!SessionPhase::Calibrating.can_transition_to(SessionPhase::RunInProgress));
        assert!(!SessionPhase::Idle.can_transition_to(SessionPhase::ResultPending));
    }
}
