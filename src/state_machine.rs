//! The init state machine: pure, I/O-free transition rules.
//!
//! Kept independent of the database and the operation registry so the
//! transition table can be unit tested without a Postgres connection.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    Uninitialized,
    Preparing,
    Copying,
    CatchingUp,
    Synchronized,
    Reinitializing,
    Failed,
}

impl InitState {
    /// Whether `to` is a legal transition target from `self`.
    pub fn can_transition(self, to: InitState) -> bool {
        use InitState::*;
        match (self, to) {
            (Uninitialized, Preparing) => true,
            (Preparing, Copying) => true,
            (Copying, CatchingUp) => true,
            (CatchingUp, Synchronized) => true,
            (Synchronized, Reinitializing) => true,
            (Reinitializing, Preparing) => true,
            // Any non-terminal state may fail.
            (Uninitialized | Preparing | Copying | CatchingUp | Reinitializing, Failed) => true,
            // Full reinit cleanup may reset any non-terminal state back to
            // uninitialized.
            (Uninitialized | Preparing | Copying | CatchingUp | Reinitializing, Uninitialized) => {
                true
            }
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InitState::Synchronized | InitState::Failed)
    }

    /// Validates and applies a transition, returning the new state or an
    /// error describing the rejected transition.
    pub fn apply(self, to: InitState) -> Result<InitState, crate::error::ValidationError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(crate::error::ValidationError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitState::Uninitialized => "uninitialized",
            InitState::Preparing => "preparing",
            InitState::Copying => "copying",
            InitState::CatchingUp => "catching_up",
            InitState::Synchronized => "synchronized",
            InitState::Reinitializing => "reinitializing",
            InitState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for InitState {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uninitialized" => InitState::Uninitialized,
            "preparing" => InitState::Preparing,
            "copying" => InitState::Copying,
            "catching_up" => InitState::CatchingUp,
            "synchronized" => InitState::Synchronized,
            "reinitializing" => InitState::Reinitializing,
            "failed" => InitState::Failed,
            other => {
                return Err(crate::error::ValidationError::Other(format!(
                    "unknown init_state: {other}"
                )));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::InitState::*;

    #[test]
    fn happy_path_is_valid() {
        assert!(Uninitialized.can_transition(Preparing));
        assert!(Preparing.can_transition(Copying));
        assert!(Copying.can_transition(CatchingUp));
        assert!(CatchingUp.can_transition(Synchronized));
        assert!(Synchronized.can_transition(Reinitializing));
        assert!(Reinitializing.can_transition(Preparing));
    }

    #[test]
    fn any_non_terminal_state_can_fail() {
        for s in [Uninitialized, Preparing, Copying, CatchingUp, Reinitializing] {
            assert!(s.can_transition(Failed), "{s:?} should be able to fail");
        }
    }

    #[test]
    fn terminal_states_reject_transitions_other_than_reinit_or_reset() {
        assert!(!Failed.can_transition(Preparing));
        assert!(!Failed.can_transition(Uninitialized));
        assert!(!Synchronized.can_transition(Copying));
    }

    #[test]
    fn skipping_phases_is_rejected() {
        assert!(!Uninitialized.can_transition(Copying));
        assert!(!Preparing.can_transition(Synchronized));
        assert!(!Copying.can_transition(Synchronized));
    }

    #[test]
    fn display_and_parse_round_trip() {
        for s in [
            Uninitialized,
            Preparing,
            Copying,
            CatchingUp,
            Synchronized,
            Reinitializing,
            Failed,
        ] {
            let rendered = s.to_string();
            let parsed: super::InitState = rendered.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn apply_rejects_invalid_transition_with_message() {
        let err = Uninitialized.apply(Synchronized).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("uninitialized"));
        assert!(msg.contains("synchronized"));
    }
}
