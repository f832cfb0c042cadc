//! Error types for genqueue.

use std::time::Duration;

use crate::pool::ResourceId;
use crate::scheduler::WorkItemId;
use crate::vars::ImageSlot;

/// Top-level error type for the scheduler core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Variable error: {0}")]
    Var(#[from] VarError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource pool integrity errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Slot {0} does not exist or has been removed")]
    InvalidSlot(ResourceId),

    #[error("Slot {0} released while not busy")]
    NotBusy(ResourceId),

    #[error("Slot {0} is already busy")]
    AlreadyBusy(ResourceId),
}

/// Errors reported by a generation backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Backend {backend} rate limited, retry after {retry_after:?}")]
    RateLimited {
        backend: String,
        retry_after: Option<Duration>,
    },

    #[error("Backend {backend} returned an invalid response: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Request {request_id} unknown to backend {backend}")]
    UnknownRequest { backend: String, request_id: String },
}

impl BackendError {
    /// Whether this error should trigger a backoff-and-retry instead of failing the queue.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Step-script parsing errors. These are recovered locally: the offending
/// segment is skipped and the rest of the script still runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("Line {line}: unknown workflow '{name}'")]
    UnknownWorkflow { line: usize, name: String },

    #[error("Line {line}: operator '{op}' is malformed: {reason}")]
    MalformedOperator {
        line: usize,
        op: String,
        reason: String,
    },

    #[error("Line {line}: unknown operator '{op}'")]
    UnknownOperator { line: usize, op: String },
}

/// Variable-store errors. Reported, never fatal: the operation is a no-op
/// and the step continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VarError {
    #[error("Image slot {0} is empty")]
    MissingImage(ImageSlot),

    #[error("Linked work item {0} no longer exists")]
    DanglingLink(WorkItemId),

    #[error("Resize target {width}x{height} exceeds the {max}px limit")]
    DimensionTooLarge { width: u32, height: u32, max: u32 },
}

/// Workflow compilation errors. The compiler degrades these to "use the
/// source as-is"; they only surface from the lower-level traits.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Source document {0} not found")]
    SourceNotFound(String),

    #[error("Conversion of {id} failed: {reason}")]
    ConversionFailed { id: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduler-level errors returned to the host.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Work item {0} not found")]
    WorkItemNotFound(WorkItemId),

    #[error("Work item {id} is {state}, cannot {action}")]
    InvalidState {
        id: WorkItemId,
        state: String,
        action: String,
    },

    #[error("Work item {0} has no archived step to retry")]
    NothingToRetry(WorkItemId),

    #[error("Work item {0} has nothing to undo")]
    NothingToUndo(WorkItemId),

    #[error("Image slot {0} cannot be linked to another work item")]
    NotLinkable(ImageSlot),
}

/// Result type alias for genqueue.
pub type Result<T> = std::result::Result<T, Error>;
