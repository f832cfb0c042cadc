//! In-process backend that fakes generation, for demos and local dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Backend, BackendRequest, Payload, PollStatus, RequestId, StepOutput};
use crate::error::BackendError;
use crate::vars::Image;

struct SimulatedRequest {
    payload: Payload,
    polls: u32,
    cancelled: bool,
}

/// Completes every request after a fixed number of polls.
///
/// Workflow runs yield a small solid image, model calls echo the last
/// message, uploads return a generated asset name.
pub struct SimulatedBackend {
    polls_to_finish: u32,
    requests: Mutex<HashMap<RequestId, SimulatedRequest>>,
}

impl SimulatedBackend {
    pub fn new(polls_to_finish: u32) -> Self {
        Self {
            polls_to_finish: polls_to_finish.max(1),
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn output_for(payload: &Payload) -> StepOutput {
        match payload {
            Payload::Workflow { document } => {
                let shade = (document.len() % 256) as u8;
                StepOutput::image(Image::solid(64, 64, [shade, shade, shade, 255]))
            }
            Payload::Chat { messages } => {
                let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
                StepOutput::text(format!("echo: {last}"))
            }
            Payload::Upload { name, .. } => StepOutput::asset(name.clone()),
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit(&self, request: &BackendRequest) -> Result<RequestId, BackendError> {
        let id = Uuid::new_v4().to_string();
        self.requests.lock().await.insert(
            id.clone(),
            SimulatedRequest {
                payload: request.payload.clone(),
                polls: 0,
                cancelled: false,
            },
        );
        tracing::debug!(request_id = %id, kind = %request.kind, "Simulated request submitted");
        Ok(id)
    }

    async fn poll_status(&self, request_id: &str) -> Result<PollStatus, BackendError> {
        let mut requests = self.requests.lock().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| BackendError::UnknownRequest {
                backend: self.name().to_string(),
                request_id: request_id.to_string(),
            })?;

        if request.cancelled {
            return Ok(PollStatus::Failed(BackendError::RequestFailed {
                backend: self.name().to_string(),
                reason: "cancelled".to_string(),
            }));
        }

        request.polls += 1;
        if request.polls >= self.polls_to_finish {
            let output = Self::output_for(&request.payload);
            requests.remove(request_id);
            return Ok(PollStatus::Done(output));
        }

        Ok(PollStatus::Pending {
            progress: Some(request.polls as f32 / self.polls_to_finish as f32),
        })
    }

    async fn cancel(&self, request_id: &str) -> Result<(), BackendError> {
        if let Some(request) = self.requests.lock().await.get_mut(request_id) {
            request.cancelled = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::WorkItemId;
    use crate::steps::StepKind;
    use crate::vars::ChatMessage;

    fn chat_request() -> BackendRequest {
        BackendRequest {
            work_item: WorkItemId(1),
            step: Uuid::new_v4(),
            kind: StepKind::CallModel,
            resource: None,
            payload: Payload::Chat {
                messages: vec![ChatMessage::user("hello")],
            },
        }
    }

    #[tokio::test]
    async fn finishes_after_configured_polls() {
        let backend = SimulatedBackend::new(2);
        let id = backend.submit(&chat_request()).await.unwrap();

        assert!(matches!(
            backend.poll_status(&id).await.unwrap(),
            PollStatus::Pending { progress: Some(_) }
        ));
        match backend.poll_status(&id).await.unwrap() {
            PollStatus::Done(output) => assert_eq!(output.text.as_deref(), Some("echo: hello")),
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(backend.poll_status(&id).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_request_reports_failure() {
        let backend = SimulatedBackend::new(5);
        let id = backend.submit(&chat_request()).await.unwrap();
        backend.cancel(&id).await.unwrap();
        assert!(matches!(
            backend.poll_status(&id).await.unwrap(),
            PollStatus::Failed(_)
        ));
    }
}
