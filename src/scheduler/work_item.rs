//! Work item aggregate: queue, variables, prompt and resource binding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::history::JobHistory;
use super::state::{StateTransition, WorkItemState};
use crate::backend::RequestId;
use crate::error::SchedulerError;
use crate::pool::ResourceId;
use crate::steps::{JobStep, StepQueue};
use crate::vars::{Image, ImageSlot, ModelPrompt, VariableStore};

/// Maximum recorded state transitions per work item.
const MAX_TRANSITIONS: usize = 200;

/// Arena id of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkItemId(pub u64);

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wi-{}", self.0)
    }
}

/// The outstanding backend call of a dispatched item.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// The dispatched step, owned until it is archived.
    pub step: JobStep,
    /// Set once the scheduler saw the backend accept the request.
    pub request_id: Option<RequestId>,
    /// Fired to stop the dispatch task and cancel its backend request.
    pub cancel: oneshot::Sender<()>,
}

/// One independently scheduled unit of work.
#[derive(Debug)]
pub struct WorkItem {
    pub(crate) id: WorkItemId,
    pub(crate) name: String,
    pub(crate) queue: StepQueue,
    pub(crate) vars: VariableStore,
    pub(crate) prompt: ModelPrompt,
    pub(crate) state: WorkItemState,
    /// Image replaced by the last workflow result.
    pub(crate) undo: Option<Image>,
    /// `temp1`/`temp2` slots that mirror another item's visible image.
    pub(crate) links: HashMap<ImageSlot, WorkItemId>,
    pub(crate) history: JobHistory,
    pub(crate) in_flight: Option<InFlight>,
    /// Whether a drain cycle is running and still owes its callback.
    pub(crate) cycle_open: bool,
    pub(crate) cycle: u64,
    /// Whether the seed step was applied in the current cycle.
    pub(crate) seeded: bool,
    pub(crate) steps_completed: usize,
    pub(crate) retry_at: Option<Instant>,
    pub(crate) rate_limit_retries: u32,
    pub(crate) progress: Option<f32>,
    /// Slot of the last completed step, tried first on the next dispatch.
    pub(crate) preferred_resource: Option<ResourceId>,
    pub(crate) transitions: Vec<StateTransition>,
    pub(crate) created_at: DateTime<Utc>,
}

impl WorkItem {
    pub(crate) fn new(id: WorkItemId, name: impl Into<String>, history_limit: usize) -> Self {
        Self {
            id,
            name: name.into(),
            queue: StepQueue::new(),
            vars: VariableStore::new(),
            prompt: ModelPrompt::default(),
            state: WorkItemState::Idle,
            undo: None,
            links: HashMap::new(),
            history: JobHistory::new(history_limit),
            in_flight: None,
            cycle_open: false,
            cycle: 0,
            seeded: false,
            steps_completed: 0,
            retry_at: None,
            rate_limit_retries: 0,
            progress: None,
            preferred_resource: None,
            transitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkItemState {
        self.state
    }

    pub fn vars(&self) -> &VariableStore {
        &self.vars
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Slot bound to the outstanding call, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        self.in_flight.as_ref().and_then(|f| f.step.resource)
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: WorkItemState,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        if !self.state.can_transition_to(new_state) {
            return Err(SchedulerError::InvalidState {
                id: self.id,
                state: self.state.to_string(),
                action: format!("transition to {new_state}"),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        Ok(())
    }

    /// Start a new drain cycle unless one is already running.
    pub(crate) fn open_cycle(&mut self) {
        if self.cycle_open {
            return;
        }
        self.cycle_open = true;
        self.cycle += 1;
        self.seeded = false;
        self.steps_completed = 0;
    }

    pub(crate) fn snapshot(&self) -> WorkItemSnapshot {
        WorkItemSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            queued: self.queue.len(),
            history: self.history.len(),
            resource: self.resource(),
            progress: self.progress,
            cycle: self.cycle,
            created_at: self.created_at,
        }
    }
}

/// Point-in-time view of a work item.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItemSnapshot {
    pub id: WorkItemId,
    pub name: String,
    pub state: WorkItemState,
    pub queued: usize,
    pub history: usize,
    pub resource: Option<ResourceId>,
    pub progress: Option<f32>,
    pub cycle: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_recorded() {
        let mut item = WorkItem::new(WorkItemId(1), "portrait", 10);
        item.transition_to(WorkItemState::Dispatched, Some("dispatch".into()))
            .unwrap();
        item.transition_to(WorkItemState::Idle, None).unwrap();

        assert_eq!(item.transitions().len(), 2);
        assert_eq!(item.transitions()[0].from, WorkItemState::Idle);
        assert_eq!(item.transitions()[0].reason.as_deref(), Some("dispatch"));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut item = WorkItem::new(WorkItemId(1), "portrait", 10);
        let err = item.transition_to(WorkItemState::Backoff, None).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState { .. }));
        assert_eq!(item.state(), WorkItemState::Idle);
    }

    #[test]
    fn cycles_open_once() {
        let mut item = WorkItem::new(WorkItemId(1), "portrait", 10);
        item.open_cycle();
        item.open_cycle();
        assert_eq!(item.cycle, 1);
        item.cycle_open = false;
        item.open_cycle();
        assert_eq!(item.cycle, 2);
    }

    #[test]
    fn id_display() {
        assert_eq!(WorkItemId(42).to_string(), "wi-42");
    }
}
