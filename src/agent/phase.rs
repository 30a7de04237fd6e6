//! Agent run phase state machine.
//!
//! ```text
//! idle ─┬─> waiting ──> requesting ──> generating ──> persisting
//!       └─────────────> requesting
//!
//! any non-terminal ──> completed | failed | cancelled | timed_out
//! ```
//!
//! Terminal phases are absorbing. Backward and skip-ahead moves are rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of an owner's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Waiting,
    Requesting,
    Generating,
    Persisting,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Outcome of checking a requested phase against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStep {
    /// Move to the requested phase.
    Advance,
    /// Same phase; status/progress may still be refreshed.
    Stay,
    /// Stale, backward, skip-ahead, or leaving a terminal phase.
    Reject,
}

impl AgentPhase {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: AgentPhase) -> bool {
        use AgentPhase::*;

        if self.is_terminal() {
            return false;
        }
        if target.is_terminal() {
            return true;
        }
        matches!(
            (self, target),
            (Idle, Waiting)
                | (Idle, Requesting)
                | (Waiting, Requesting)
                | (Requesting, Generating)
                | (Generating, Persisting)
        )
    }

    /// Classify a phase update.
    pub fn step_to(&self, target: AgentPhase) -> PhaseStep {
        if *self == target && !self.is_terminal() {
            PhaseStep::Stay
        } else if self.can_transition_to(target) {
            PhaseStep::Advance
        } else {
            PhaseStep::Reject
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Requesting => "requesting",
            Self::Generating => "generating",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentPhase::*;

    #[test]
    fn forward_path_is_allowed() {
        assert!(Idle.can_transition_to(Waiting));
        assert!(Idle.can_transition_to(Requesting));
        assert!(Waiting.can_transition_to(Requesting));
        assert!(Requesting.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Persisting));
        assert!(Persisting.can_transition_to(Completed));
    }

    #[test]
    fn backward_and_skip_ahead_are_rejected() {
        assert_eq!(Generating.step_to(Requesting), PhaseStep::Reject);
        assert_eq!(Persisting.step_to(Generating), PhaseStep::Reject);
        assert_eq!(Requesting.step_to(Persisting), PhaseStep::Reject);
        assert_eq!(Waiting.step_to(Generating), PhaseStep::Reject);
    }

    #[test]
    fn terminals_are_absorbing() {
        for terminal in [Completed, Failed, Cancelled, TimedOut] {
            assert!(terminal.is_terminal());
            for target in [Idle, Waiting, Requesting, Generating, Persisting, Completed, Failed] {
                assert_eq!(terminal.step_to(target), PhaseStep::Reject);
            }
        }
    }

    #[test]
    fn any_live_phase_can_terminate() {
        for live in [Idle, Waiting, Requesting, Generating, Persisting] {
            assert!(!live.is_terminal());
            assert!(live.can_transition_to(Cancelled));
            assert!(live.can_transition_to(TimedOut));
        }
    }

    #[test]
    fn same_phase_stays() {
        assert_eq!(Generating.step_to(Generating), PhaseStep::Stay);
    }

    #[test]
    fn display_matches_serde() {
        assert_eq!(TimedOut.to_string(), "timed_out");
        assert_eq!(serde_json::to_string(&TimedOut).unwrap(), "\"timed_out\"");
    }
}
