//! Backend contract: the only surface the scheduler needs from generation services.
//!
//! Concrete image-synthesis engines and language-model providers live in
//! the host application. They implement [`Backend`]: submit a request,
//! report its status when polled, and accept best-effort cancellation.

mod simulated;

pub use simulated::SimulatedBackend;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BackendError;
use crate::pool::ResourceId;
use crate::scheduler::WorkItemId;
use crate::steps::{StepId, StepKind};
use crate::vars::{ChatMessage, Image};

/// Backend-assigned handle for an outstanding request.
pub type RequestId = String;

/// Final request content.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Payload {
    /// A compiled workflow document with all placeholders substituted.
    Workflow { document: String },
    /// A model conversation.
    Chat { messages: Vec<ChatMessage> },
    /// An image to upload under `name`.
    Upload {
        name: String,
        #[serde(skip)]
        png: Vec<u8>,
    },
}

/// A request handed to [`Backend::submit`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendRequest {
    pub work_item: WorkItemId,
    pub step: StepId,
    pub kind: StepKind,
    /// Slot the request is bound to; `None` for steps that need no resource.
    pub resource: Option<ResourceId>,
    pub payload: Payload,
}

/// What a finished request produced.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub images: Vec<Image>,
    /// Model reply text.
    pub text: Option<String>,
    /// Server-side name of an uploaded asset.
    pub asset_name: Option<String>,
}

impl StepOutput {
    pub fn image(image: Image) -> Self {
        Self {
            images: vec![image],
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn asset(name: impl Into<String>) -> Self {
        Self {
            asset_name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Status of an outstanding request.
#[derive(Debug, Clone)]
pub enum PollStatus {
    Pending { progress: Option<f32> },
    Done(StepOutput),
    Failed(BackendError),
}

/// A generation service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Start a request.
    async fn submit(&self, request: &BackendRequest) -> Result<RequestId, BackendError>;

    /// Report the status of a request.
    async fn poll_status(&self, request_id: &str) -> Result<PollStatus, BackendError>;

    /// Ask the backend to stop a request. Best effort.
    async fn cancel(&self, request_id: &str) -> Result<(), BackendError>;
}
