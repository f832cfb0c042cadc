//! Scheduler: work items, their state machine and the tick loop.
//!
//! Core components:
//! - `work_item`: WorkItem aggregate and arena ids
//! - `state`: Idle → WaitingForResource → Dispatched → Idle / Failed
//! - `history`: archived steps per work item
//! - `ops`: inline variable operations with cross-item image links
//! - `dispatch`: spawned backend call driver and its events
//! - `scheduler`: the cooperative `tick()` driving everything

mod dispatch;
pub mod history;
mod ops;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod state;
pub mod work_item;

pub use dispatch::{BackendEvent, BackendEventKind};
pub use history::{HistoryEntry, JobHistory, StepOutcome};
pub use scheduler::{EnqueueReport, Scheduler, TickReport};
pub use state::{StateTransition, WorkItemState};
pub use work_item::{WorkItem, WorkItemId, WorkItemSnapshot};
