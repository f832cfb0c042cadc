//! Backend call driver.
//!
//! Each dispatched step runs as one spawned task that prepares the final
//! payload, submits it and polls until the request settles. The task never
//! touches scheduler state: everything it learns is sent back as a
//! [`BackendEvent`] and applied on the next tick.
//!
//! Cancellation arrives over a oneshot channel rather than by aborting the
//! task, so a request the backend already accepted is always cancelled
//! there, even if the scheduler never saw its `Submitted` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::work_item::WorkItemId;
use crate::backend::{Backend, BackendRequest, Payload, PollStatus, RequestId, StepOutput};
use crate::compiler::{WorkflowCompiler, placeholders};
use crate::error::BackendError;
use crate::pool::ResourceId;
use crate::steps::{StepId, StepKind};
use crate::vars::Image;

/// What happened to a dispatched step.
#[derive(Debug)]
pub enum BackendEventKind {
    Submitted(RequestId),
    Progress(f32),
    Completed(StepOutput),
    Failed(BackendError),
}

/// A message from a dispatch task to the scheduler.
#[derive(Debug)]
pub struct BackendEvent {
    pub work_item: WorkItemId,
    pub step: StepId,
    pub kind: BackendEventKind,
}

/// Payload content captured at dispatch, finished inside the task.
#[derive(Debug)]
pub(crate) enum PendingPayload {
    /// Compile `template`, then substitute the captured bindings.
    Workflow {
        template: String,
        bindings: HashMap<String, String>,
        seed: u32,
    },
    /// Encode the image as PNG and upload it under `name`.
    Upload { name: String, image: Image },
    Ready(Payload),
}

pub(crate) struct DispatchJob {
    pub work_item: WorkItemId,
    pub step: StepId,
    pub kind: StepKind,
    pub resource: Option<ResourceId>,
    pub payload: PendingPayload,
    pub backend: Arc<dyn Backend>,
    pub compiler: Arc<WorkflowCompiler>,
    pub events: mpsc::UnboundedSender<BackendEvent>,
    pub poll_interval: Duration,
}

impl DispatchJob {
    /// Drive the request to completion. Dropping or firing `cancel` stops
    /// the job; once the backend has handed out a request id, that request
    /// is cancelled on the backend before the task exits.
    pub(crate) async fn run(self, mut cancel: oneshot::Receiver<()>) {
        let prepared = tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!(work_item = %self.work_item, step = %self.step, "Dispatch cancelled before submit");
                return;
            }
            prepared = self.prepare() => prepared,
        };
        let payload = match prepared {
            Ok(payload) => payload,
            Err(e) => {
                self.send(BackendEventKind::Failed(e));
                return;
            }
        };

        let request = BackendRequest {
            work_item: self.work_item,
            step: self.step,
            kind: self.kind,
            resource: self.resource,
            payload,
        };

        // Not raced against `cancel`: dropping an accepted submit loses its id.
        let request_id = match self.backend.submit(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(work_item = %self.work_item, error = %e, "Submit failed");
                self.send(BackendEventKind::Failed(e));
                return;
            }
        };
        debug!(work_item = %self.work_item, request_id = %request_id, "Request submitted");

        if cancel_requested(&mut cancel) {
            self.cancel_request(&request_id).await;
            return;
        }
        self.send(BackendEventKind::Submitted(request_id.clone()));

        tokio::select! {
            biased;
            _ = &mut cancel => self.cancel_request(&request_id).await,
            () = self.poll_until_settled(&request_id) => {}
        }
    }

    async fn poll_until_settled(&self, request_id: &RequestId) {
        loop {
            match self.backend.poll_status(request_id).await {
                Ok(PollStatus::Pending { progress }) => {
                    if let Some(fraction) = progress {
                        self.send(BackendEventKind::Progress(fraction));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(PollStatus::Done(output)) => {
                    self.send(BackendEventKind::Completed(output));
                    return;
                }
                Ok(PollStatus::Failed(e)) | Err(e) => {
                    self.send(BackendEventKind::Failed(e));
                    return;
                }
            }
        }
    }

    async fn cancel_request(&self, request_id: &RequestId) {
        match self.backend.cancel(request_id).await {
            Ok(()) => {
                debug!(work_item = %self.work_item, request_id = %request_id, "Backend request cancelled")
            }
            Err(e) => {
                warn!(work_item = %self.work_item, request_id = %request_id, error = %e, "Backend cancel failed")
            }
        }
    }

    async fn prepare(&self) -> Result<Payload, BackendError> {
        match &self.payload {
            PendingPayload::Workflow {
                template,
                bindings,
                seed,
            } => {
                let compiled = self.compiler.compile(template).await.map_err(|e| {
                    BackendError::RequestFailed {
                        backend: self.backend.name().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Payload::Workflow {
                    document: placeholders::substitute(&compiled.body, bindings, *seed),
                })
            }
            PendingPayload::Upload { name, image } => {
                let png = image.encode_png().map_err(|e| BackendError::RequestFailed {
                    backend: self.backend.name().to_string(),
                    reason: format!("failed to encode {name}: {e}"),
                })?;
                Ok(Payload::Upload {
                    name: name.clone(),
                    png,
                })
            }
            PendingPayload::Ready(payload) => Ok(payload.clone()),
        }
    }

    fn send(&self, kind: BackendEventKind) {
        // The receiver only goes away with the scheduler.
        let _ = self.events.send(BackendEvent {
            work_item: self.work_item,
            step: self.step,
            kind,
        });
    }
}

/// A fired or dropped sender both mean the scheduler gave up on the step.
fn cancel_requested(cancel: &mut oneshot::Receiver<()>) -> bool {
    !matches!(cancel.try_recv(), Err(oneshot::error::TryRecvError::Empty))
}
