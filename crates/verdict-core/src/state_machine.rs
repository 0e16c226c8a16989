use crate::error::VerdictError;
use serde::{Deserialize, Serialize};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, configuration attached, nothing dispatched yet
    Created,
    /// Collecting common parameters
    CollectingCommon,
    /// Collecting pages, tabs and parameters
    CollectingPages,
    /// Session barrier fired, computing final status
    Aggregating,
    /// Final status published; may be executed again
    Resolved,
    /// Evicted by the session sweep
    Expired,
}

impl SessionState {
    /// Whether a new execution may start from this state
    #[inline]
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, SessionState::Created | SessionState::Resolved)
    }

    /// Whether the state is one a waiting caller can stop on
    #[inline]
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, SessionState::Resolved | SessionState::Expired)
    }
}

/// Validates a state transition.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), VerdictError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(VerdictError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: SessionState) -> Vec<SessionState> {
    use SessionState::*;
    match from {
        Created => vec![CollectingCommon, CollectingPages, Expired],
        CollectingCommon => vec![CollectingPages, Aggregating, Expired],
        CollectingPages => vec![Aggregating, Expired],
        Aggregating => vec![Resolved, Expired],
        Resolved => vec![CollectingCommon, CollectingPages, Expired],
        Expired => vec![],
    }
}

fn allowed(from: SessionState, to: SessionState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
