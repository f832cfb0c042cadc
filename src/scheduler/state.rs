//! Work item state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    /// No outstanding call, no resource held.
    Idle,
    /// Head step needs a resource and none is available.
    WaitingForResource,
    /// Resource bound, backend call outstanding.
    Dispatched,
    /// Rate limited; the same step is retried once the backoff elapses.
    Backoff,
    /// Last cycle failed. Queue cleared, resource released.
    Failed,
}

impl WorkItemState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkItemState) -> bool {
        use WorkItemState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, WaitingForResource) | (Idle, Dispatched) | (Idle, Failed) |
            // From WaitingForResource
            (WaitingForResource, Dispatched) | (WaitingForResource, Idle) |
            // From Dispatched
            (Dispatched, Idle) | (Dispatched, Failed) | (Dispatched, Backoff) |
            // From Backoff
            (Backoff, Idle) |
            // From Failed (a new queue was handed over)
            (Failed, Idle)
        )
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::WaitingForResource => "waiting_for_resource",
            Self::Dispatched => "dispatched",
            Self::Backoff => "backoff",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkItemState,
    pub to: WorkItemState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        use WorkItemState::*;
        assert!(Idle.can_transition_to(WaitingForResource));
        assert!(Idle.can_transition_to(Dispatched));
        assert!(WaitingForResource.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Idle));
        assert!(Dispatched.can_transition_to(Failed));
        assert!(Dispatched.can_transition_to(Backoff));
        assert!(Backoff.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Idle));
    }

    #[test]
    fn state_transitions_invalid() {
        use WorkItemState::*;
        assert!(!Failed.can_transition_to(Dispatched));
        assert!(!Backoff.can_transition_to(Dispatched));
        assert!(!WaitingForResource.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Backoff));
    }

    #[test]
    fn state_display() {
        assert_eq!(WorkItemState::WaitingForResource.to_string(), "waiting_for_resource");
        assert_eq!(WorkItemState::Dispatched.to_string(), "dispatched");
    }
}
