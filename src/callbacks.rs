//! Callback dispatcher: the single integration point for drain outcomes.
//!
//! Exactly one [`Completion`] is dispatched per drain cycle: success when the
//! queue and all synthetic sub-steps are empty, failure when a step fails
//! terminally or the item is force-finished. A dispatcher may hand back more
//! work for the same item through [`FollowUp::Enqueue`]; the scheduler keeps
//! processing that item instead of treating it as finished.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::scheduler::WorkItemId;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Why a cycle ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum FailureReason {
    /// The backend reported an error; carries its message.
    Backend(String),
    /// The item was force-finished.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(message) => write!(f, "{message}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a drain cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    Success,
    Failure { reason: FailureReason },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Notification for one finished drain cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub work_item: WorkItemId,
    /// Drain cycle number, starting at 1 for each work item.
    pub cycle: u64,
    pub outcome: Outcome,
    /// Steps that completed during this cycle.
    pub steps_completed: usize,
}

/// What the dispatcher wants done with the item afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FollowUp {
    #[default]
    Done,
    /// Parse and enqueue these script lines on the same work item.
    Enqueue(Vec<String>),
}

/// Receives drain outcomes.
pub trait CallbackDispatcher: Send + Sync {
    fn dispatch(&self, completion: &Completion) -> FollowUp;
}

impl<F> CallbackDispatcher for F
where
    F: Fn(&Completion) -> FollowUp + Send + Sync,
{
    fn dispatch(&self, completion: &Completion) -> FollowUp {
        self(completion)
    }
}

/// Fans completions out to any number of subscribers.
pub struct ChannelDispatcher {
    tx: broadcast::Sender<Completion>,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.tx.subscribe()
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackDispatcher for ChannelDispatcher {
    fn dispatch(&self, completion: &Completion) -> FollowUp {
        tracing::debug!(
            work_item = %completion.work_item,
            cycle = completion.cycle,
            success = completion.outcome.is_success(),
            "Broadcasting completion"
        );
        // Ok if nobody is listening
        let _ = self.tx.send(completion.clone());
        FollowUp::Done
    }
}
