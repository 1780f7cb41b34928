//! Service lifecycle state machine (§3, §4.12).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The lifecycle phase of a `Service`/`SingleActiveService` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Initializing,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

/// An invalid lifecycle transition was attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal lifecycle transition: {from:?} -> {to:?}")]
pub struct IllegalLifecycleTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl LifecycleState {
    /// True if `to` is a legal transition from `self`.
    ///
    /// `Initializing -> Starting -> Started -> Stopping -> Stopped`, with a
    /// failure during `Starting` or `Stopping` moving to `Failed`.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Initializing, Starting)
                | (Starting, Started)
                | (Starting, Failed)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    /// Validates and returns the transition, or the corresponding error.
    pub fn transition(self, to: LifecycleState) -> Result<LifecycleState, IllegalLifecycleTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(IllegalLifecycleTransition { from: self, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn happy_path_sequence() {
        let mut s = Initializing;
        for next in [Starting, Started, Stopping, Stopped] {
            s = s.transition(next).unwrap();
        }
        assert_eq!(s, Stopped);
    }

    #[test]
    fn failure_during_start_is_allowed() {
        assert!(Starting.transition(Failed).is_ok());
    }

    #[test]
    fn failure_during_stop_is_allowed() {
        assert!(Stopping.transition(Failed).is_ok());
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(Initializing.transition(Started).is_err());
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        assert!(Stopped.transition(Starting).is_err());
        assert!(Failed.transition(Starting).is_err());
    }
}
