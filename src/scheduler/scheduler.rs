//! Cooperative tick scheduler.
//!
//! All work item state lives in one arena owned by the scheduler and is
//! only mutated from [`Scheduler::tick`] and the host-facing methods, so no
//! locking is needed around variable stores or queues. Backend calls run
//! in spawned tasks and report back through an unbounded channel that the
//! tick drains before advancing work items.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::{BackendEvent, BackendEventKind, DispatchJob, PendingPayload};
use super::history::{HistoryEntry, StepOutcome};
use super::ops;
use super::state::WorkItemState;
use super::work_item::{InFlight, WorkItem, WorkItemId, WorkItemSnapshot};
use crate::backend::{Backend, Payload, StepOutput};
use crate::callbacks::{CallbackDispatcher, Completion, FailureReason, FollowUp, Outcome};
use crate::compiler::WorkflowCompiler;
use crate::config::SchedulerConfig;
use crate::error::{BackendError, SchedulerError, StepError};
use crate::pool::{ResourceAllocator, ResourceId};
use crate::steps::{JobStep, Requirement, StepCatalog, StepKind, parse_lines, parse_script};
use crate::vars::{Image, ImageSlot, VariableStore};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Backend events applied.
    pub events: usize,
    /// Steps handed to the backend.
    pub dispatched: usize,
    /// Command steps and skipped uploads finished inline.
    pub ran_inline: usize,
    /// Items still waiting for a resource.
    pub waiting: usize,
    /// Callbacks fired.
    pub callbacks: usize,
}

/// Result of handing steps to a work item.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub enqueued: usize,
    /// Recoverable parse problems; their lines or operators were skipped.
    pub errors: Vec<StepError>,
}

/// What advancing a single item did.
enum Advance {
    Nothing,
    Dispatched,
    RanInline,
    Waiting,
    Finished,
}

/// Drives every work item's step queue against the resource pool and backend.
pub struct Scheduler {
    config: SchedulerConfig,
    catalog: StepCatalog,
    pool: Box<dyn ResourceAllocator>,
    backend: Arc<dyn Backend>,
    compiler: Arc<WorkflowCompiler>,
    callbacks: Arc<dyn CallbackDispatcher>,
    items: BTreeMap<WorkItemId, WorkItem>,
    next_id: u64,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        config: SchedulerConfig,
        catalog: StepCatalog,
        pool: Box<dyn ResourceAllocator>,
        backend: Arc<dyn Backend>,
        compiler: Arc<WorkflowCompiler>,
        callbacks: Arc<dyn CallbackDispatcher>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            catalog,
            pool,
            backend,
            compiler,
            callbacks,
            items: BTreeMap::new(),
            next_id: 1,
            events_tx,
            events_rx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub fn pool(&self) -> &dyn ResourceAllocator {
        self.pool.as_ref()
    }

    // ── Work item lifecycle ─────────────────────────────────────────

    pub fn create_work_item(&mut self, name: impl Into<String>) -> WorkItemId {
        let id = WorkItemId(self.next_id);
        self.next_id += 1;
        let item = WorkItem::new(id, name, self.config.history_limit);
        info!(work_item = %id, name = %item.name, "Work item created");
        self.items.insert(id, item);
        id
    }

    /// Discard a work item. An outstanding call is cancelled and its slot
    /// released before the item goes away. No callback fires.
    pub fn destroy(&mut self, id: WorkItemId) -> Result<(), SchedulerError> {
        let mut item = self
            .items
            .remove(&id)
            .ok_or(SchedulerError::WorkItemNotFound(id))?;

        if let Some(in_flight) = item.in_flight.take() {
            let step = self.abandon(id, in_flight);
            debug!(work_item = %id, workflow = %step.workflow, "Abandoned in-flight step");
        }

        for other in self.items.values_mut() {
            other.links.retain(|_, linked| *linked != id);
        }

        info!(work_item = %id, "Work item destroyed");
        Ok(())
    }

    /// Cancel the outstanding call, drop the rest of the queue and return
    /// the item to `Idle`. A running cycle ends with a `Cancelled` failure.
    pub fn force_finish(&mut self, id: WorkItemId) -> Result<(), SchedulerError> {
        let in_flight = self.item_mut(id)?.in_flight.take();
        if let Some(in_flight) = in_flight {
            let mut step = self.abandon(id, in_flight);
            step.ended_at = Some(Utc::now());
            if let Some(item) = self.items.get_mut(&id) {
                item.history.push(step, StepOutcome::Cancelled);
            }
        }

        let item = self.item_mut(id)?;
        let dropped = item.queue.clear();
        item.retry_at = None;
        item.rate_limit_retries = 0;
        item.progress = None;
        set_state(item, WorkItemState::Idle, "force finished");
        let fire = item.cycle_open;
        info!(work_item = %id, dropped, "Work item force finished");

        if fire {
            self.fire_callback(
                id,
                Outcome::Failure {
                    reason: FailureReason::Cancelled,
                },
            );
        }
        Ok(())
    }

    /// Stop tracking an in-flight call: tell its task to cancel the backend
    /// request and release its slot.
    fn abandon(&mut self, id: WorkItemId, in_flight: InFlight) -> JobStep {
        let InFlight {
            step,
            request_id,
            cancel,
        } = in_flight;

        // Err means the task already settled; its final event goes stale.
        if cancel.send(()).is_err() {
            debug!(work_item = %id, step = %step.id, "Dispatch task already finished");
        } else {
            debug!(work_item = %id, step = %step.id, request_id = ?request_id, "Cancellation requested");
        }

        release_slot(self.pool.as_mut(), id, &step);
        step
    }

    // ── Queue input ─────────────────────────────────────────────────

    /// Parse a multi-line script and append its steps.
    pub fn enqueue_script(
        &mut self,
        id: WorkItemId,
        script: &str,
    ) -> Result<EnqueueReport, SchedulerError> {
        let parsed = parse_script(script, &self.catalog);
        let enqueued = self.enqueue_steps(id, parsed.steps)?;
        Ok(EnqueueReport {
            enqueued,
            errors: parsed.errors,
        })
    }

    /// Parse script lines and append their steps.
    pub fn enqueue_lines<S: AsRef<str>>(
        &mut self,
        id: WorkItemId,
        lines: &[S],
    ) -> Result<EnqueueReport, SchedulerError> {
        let parsed = parse_lines(lines, &self.catalog);
        let enqueued = self.enqueue_steps(id, parsed.steps)?;
        Ok(EnqueueReport {
            enqueued,
            errors: parsed.errors,
        })
    }

    /// Append already-built steps. Starts a new drain cycle if none is
    /// running; an empty list changes nothing.
    pub fn enqueue_steps(
        &mut self,
        id: WorkItemId,
        steps: Vec<JobStep>,
    ) -> Result<usize, SchedulerError> {
        let item = self.item_mut(id)?;
        let count = steps.len();
        if count == 0 {
            return Ok(0);
        }

        item.queue.extend(steps);
        item.open_cycle();
        if item.state == WorkItemState::Failed {
            set_state(item, WorkItemState::Idle, "new steps enqueued");
        }
        debug!(work_item = %id, count, cycle = item.cycle, "Steps enqueued");
        Ok(count)
    }

    /// Step whose variable operations run at the start of every cycle.
    pub fn set_seed(&mut self, id: WorkItemId, seed: JobStep) -> Result<(), SchedulerError> {
        self.item_mut(id)?.queue.set_seed(seed);
        Ok(())
    }

    /// Re-enqueue a fresh copy of the most recently archived step.
    pub fn retry_last(&mut self, id: WorkItemId) -> Result<(), SchedulerError> {
        let step = self
            .item(id)?
            .history
            .last()
            .map(|entry| entry.step.instantiate())
            .ok_or(SchedulerError::NothingToRetry(id))?;
        info!(work_item = %id, workflow = %step.workflow, "Retrying last step");
        self.enqueue_steps(id, vec![step])?;
        Ok(())
    }

    // ── Variables and images ────────────────────────────────────────

    pub fn vars(&self, id: WorkItemId) -> Result<&VariableStore, SchedulerError> {
        Ok(&self.item(id)?.vars)
    }

    pub fn vars_mut(&mut self, id: WorkItemId) -> Result<&mut VariableStore, SchedulerError> {
        Ok(&mut self.item_mut(id)?.vars)
    }

    /// Current content of an image slot, following temp links.
    pub fn image(&self, id: WorkItemId, slot: ImageSlot) -> Result<Option<Image>, SchedulerError> {
        self.item(id)?;
        match ops::read_image(&self.items, id, slot) {
            Ok(image) => Ok(image),
            Err(e) => {
                warn!(work_item = %id, error = %e, "Image read failed");
                Ok(None)
            }
        }
    }

    pub fn set_image(
        &mut self,
        id: WorkItemId,
        slot: ImageSlot,
        image: Image,
    ) -> Result<(), SchedulerError> {
        self.item_mut(id)?.vars.set_image(slot, image);
        Ok(())
    }

    /// Point `temp1` or `temp2` at another item's visible image, or unlink
    /// it with `None`.
    pub fn link_temp(
        &mut self,
        id: WorkItemId,
        slot: ImageSlot,
        target: Option<WorkItemId>,
    ) -> Result<(), SchedulerError> {
        if !matches!(slot, ImageSlot::Temp1 | ImageSlot::Temp2) {
            return Err(SchedulerError::NotLinkable(slot));
        }
        if let Some(target) = target {
            self.item(target)?;
        }
        let item = self.item_mut(id)?;
        match target {
            Some(target) => {
                item.links.insert(slot, target);
            }
            None => {
                item.links.remove(&slot);
            }
        }
        Ok(())
    }

    /// Swap the visible image with the one saved before the last workflow result.
    pub fn undo(&mut self, id: WorkItemId) -> Result<(), SchedulerError> {
        let item = self.item_mut(id)?;
        let previous = item.undo.take().ok_or(SchedulerError::NothingToUndo(id))?;
        item.undo = item.vars.set_image(ImageSlot::Image, previous);
        debug!(work_item = %id, "Undo applied");
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn state(&self, id: WorkItemId) -> Result<WorkItemState, SchedulerError> {
        Ok(self.item(id)?.state)
    }

    pub fn history(&self, id: WorkItemId) -> Result<Vec<HistoryEntry>, SchedulerError> {
        Ok(self.item(id)?.history.to_vec())
    }

    /// Last progress fraction reported for the outstanding call.
    pub fn progress(&self, id: WorkItemId) -> Result<Option<f32>, SchedulerError> {
        Ok(self.item(id)?.progress)
    }

    pub fn work_item(&self, id: WorkItemId) -> Option<&WorkItem> {
        self.items.get(&id)
    }

    pub fn snapshot(&self) -> Vec<WorkItemSnapshot> {
        self.items.values().map(WorkItem::snapshot).collect()
    }

    /// Whether any item still has something to do or to report.
    pub fn has_pending_work(&self) -> bool {
        self.items.values().any(|item| {
            item.in_flight.is_some()
                || item.cycle_open
                || !item.queue.is_drained()
                || item.state == WorkItemState::Backoff
        })
    }

    // ── Driving ─────────────────────────────────────────────────────

    /// Apply pending backend events, then advance every work item by at
    /// most one step. Never blocks. Must run inside a Tokio runtime.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        while let Ok(event) = self.events_rx.try_recv() {
            report.events += 1;
            if self.handle_event(event) {
                report.callbacks += 1;
            }
        }

        let ids: Vec<WorkItemId> = self.items.keys().copied().collect();
        for id in ids {
            match self.advance(id) {
                Advance::Nothing => {}
                Advance::Dispatched => report.dispatched += 1,
                Advance::RanInline => report.ran_inline += 1,
                Advance::Waiting => report.waiting += 1,
                Advance::Finished => report.callbacks += 1,
            }
        }

        report
    }

    /// Wait up to `timeout` for the next backend event and apply it.
    /// Returns whether an event arrived.
    pub async fn wait_for_event(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.events_rx.recv()).await {
            Ok(Some(event)) => {
                self.handle_event(event);
                true
            }
            _ => false,
        }
    }

    /// Tick until no item has pending work. Items waiting on a resource
    /// nobody will release keep this running.
    pub async fn run_until_idle(&mut self) {
        loop {
            self.tick();
            if !self.has_pending_work() {
                return;
            }
            self.wait_for_event(self.config.tick_interval).await;
        }
    }

    /// Drive a shared scheduler on a fixed interval.
    pub fn spawn_tick_loop(scheduler: Arc<Mutex<Scheduler>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = scheduler.lock().await.config.tick_interval;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = scheduler.lock().await.tick();
                if report != TickReport::default() {
                    debug!(?report, "Tick");
                }
            }
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    fn item(&self, id: WorkItemId) -> Result<&WorkItem, SchedulerError> {
        self.items
            .get(&id)
            .ok_or(SchedulerError::WorkItemNotFound(id))
    }

    fn item_mut(&mut self, id: WorkItemId) -> Result<&mut WorkItem, SchedulerError> {
        self.items
            .get_mut(&id)
            .ok_or(SchedulerError::WorkItemNotFound(id))
    }

    /// Apply one backend event. Returns whether a callback fired.
    fn handle_event(&mut self, event: BackendEvent) -> bool {
        let BackendEvent {
            work_item: id,
            step,
            kind,
        } = event;

        let Some(item) = self.items.get_mut(&id) else {
            debug!(work_item = %id, "Event for a destroyed work item ignored");
            return false;
        };
        let Some(in_flight) = item.in_flight.as_mut().filter(|f| f.step.id == step) else {
            debug!(work_item = %id, step = %step, "Stale backend event ignored");
            return false;
        };

        match kind {
            BackendEventKind::Submitted(request_id) => {
                in_flight.request_id = Some(request_id);
                false
            }
            BackendEventKind::Progress(fraction) => {
                item.progress = Some(fraction.clamp(0.0, 1.0));
                false
            }
            BackendEventKind::Completed(output) => {
                self.complete_step(id, output);
                false
            }
            BackendEventKind::Failed(e) => self.fail_step(id, e),
        }
    }

    fn complete_step(&mut self, id: WorkItemId, output: StepOutput) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let Some(InFlight { mut step, .. }) = item.in_flight.take() else {
            return;
        };

        release_slot(self.pool.as_mut(), id, &step);
        step.ended_at = Some(Utc::now());

        match step.kind {
            StepKind::RunWorkflow => {
                if let Some(image) = output.images.into_iter().next() {
                    let previous = item.vars.set_image(ImageSlot::Image, image);
                    if !step.no_undo() && previous.is_some() {
                        item.undo = previous;
                    }
                }
            }
            StepKind::CallModel => {
                if let Some(reply) = output.text {
                    item.vars.set("model_reply", reply);
                }
            }
            StepKind::UploadAsset => {
                if let (Some(spec), Some(name)) = (&step.upload, output.asset_name) {
                    item.vars.set(spec.target_variable(), name);
                }
            }
            StepKind::Command => {}
        }

        info!(
            work_item = %id,
            workflow = %step.workflow,
            resource = ?step.resource,
            "Step completed"
        );
        item.preferred_resource = step.resource;
        item.progress = None;
        item.rate_limit_retries = 0;
        item.steps_completed += 1;
        item.history.push(step, StepOutcome::Completed);
        set_state(item, WorkItemState::Idle, "step completed");
    }

    /// Returns whether the failure callback fired.
    fn fail_step(&mut self, id: WorkItemId, err: BackendError) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        let Some(InFlight { mut step, .. }) = item.in_flight.take() else {
            return false;
        };

        release_slot(self.pool.as_mut(), id, &step);
        item.progress = None;

        if err.is_rate_limited() && item.rate_limit_retries < self.config.max_rate_limit_retries {
            item.rate_limit_retries += 1;
            let backoff = match &err {
                BackendError::RateLimited {
                    retry_after: Some(after),
                    ..
                } => *after,
                _ => self.config.rate_limit_backoff,
            };
            warn!(
                work_item = %id,
                workflow = %step.workflow,
                attempt = item.rate_limit_retries,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limited, retrying step after backoff"
            );
            item.retry_at = Some(Instant::now() + backoff);
            item.queue.push_front(step.instantiate());
            set_state(item, WorkItemState::Backoff, "rate limited");
            return false;
        }

        let reason = err.to_string();
        error!(work_item = %id, workflow = %step.workflow, error = %reason, "Step failed");
        step.ended_at = Some(Utc::now());
        item.history.push(
            step,
            StepOutcome::Failed {
                reason: reason.clone(),
            },
        );
        let dropped = item.queue.clear();
        if dropped > 0 {
            debug!(work_item = %id, dropped, "Remaining steps discarded");
        }
        item.rate_limit_retries = 0;
        set_state(item, WorkItemState::Failed, "backend error");

        self.fire_callback(
            id,
            Outcome::Failure {
                reason: FailureReason::Backend(reason),
            },
        );
        true
    }

    /// Close the current cycle and notify the dispatcher. Follow-up steps
    /// open the next cycle on the same item.
    fn fire_callback(&mut self, id: WorkItemId, outcome: Outcome) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        item.cycle_open = false;
        let completion = Completion {
            work_item: id,
            cycle: item.cycle,
            outcome,
            steps_completed: item.steps_completed,
        };
        info!(
            work_item = %id,
            cycle = completion.cycle,
            success = completion.outcome.is_success(),
            steps = completion.steps_completed,
            "Drain cycle finished"
        );

        if let FollowUp::Enqueue(lines) = self.callbacks.dispatch(&completion) {
            match self.enqueue_lines(id, lines.as_slice()) {
                Ok(report) if report.enqueued > 0 => {
                    debug!(work_item = %id, count = report.enqueued, "Callback enqueued follow-up steps");
                }
                Ok(_) => {}
                Err(e) => warn!(work_item = %id, error = %e, "Follow-up enqueue failed"),
            }
        }
    }

    fn advance(&mut self, id: WorkItemId) -> Advance {
        let Some(item) = self.items.get_mut(&id) else {
            return Advance::Nothing;
        };

        match item.state {
            WorkItemState::Dispatched | WorkItemState::Failed => return Advance::Nothing,
            WorkItemState::Backoff => {
                if item.retry_at.is_some_and(|at| Instant::now() < at) {
                    return Advance::Nothing;
                }
                item.retry_at = None;
                set_state(item, WorkItemState::Idle, "backoff elapsed");
            }
            WorkItemState::Idle | WorkItemState::WaitingForResource => {}
        }

        if item.in_flight.is_some() {
            return Advance::Nothing;
        }

        if item.queue.is_drained() {
            if item.cycle_open {
                self.fire_callback(id, Outcome::Success);
                return Advance::Finished;
            }
            return Advance::Nothing;
        }

        if !item.seeded {
            item.seeded = true;
            if let Some(seed) = item.queue.seed().cloned() {
                debug!(work_item = %id, "Applying seed operations");
                ops::apply(&mut self.items, id, &seed.ops);
            }
        }

        let Some(item) = self.items.get_mut(&id) else {
            return Advance::Nothing;
        };
        materialize_uploads(item);

        let Some(head) = item.queue.peek() else {
            return Advance::Nothing;
        };

        if head.kind == StepKind::Command {
            return self.run_inline(id);
        }

        if let Some(upload) = &head.upload {
            let source = ImageSlot::from_name(&upload.source).unwrap_or(ImageSlot::Image);
            if !matches!(ops::read_image(&self.items, id, source), Ok(Some(_))) {
                warn!(work_item = %id, slot = %source, "Nothing to upload, skipping");
                return self.run_inline(id);
            }
        }

        let Some(item) = self.items.get_mut(&id) else {
            return Advance::Nothing;
        };
        let Some(head) = item.queue.peek() else {
            return Advance::Nothing;
        };
        let requirement = head.requirement.resolve(item.vars.requirements());

        let resource = match requirement.class() {
            None => None,
            Some((class, size)) => {
                let acquired = self
                    .pool
                    .try_acquire_free(class, size, item.preferred_resource)
                    .or_else(|| self.pool.acquire_least_busy(class, size));
                match acquired {
                    Some(resource) => Some(resource),
                    None => {
                        if item.state != WorkItemState::WaitingForResource {
                            debug!(work_item = %id, ?class, ?size, "No free slot, waiting");
                            set_state(item, WorkItemState::WaitingForResource, "no free slot");
                        }
                        return Advance::Waiting;
                    }
                }
            }
        };

        self.dispatch(id, requirement, resource)
    }

    /// Pop the head step and finish it without a backend call.
    fn run_inline(&mut self, id: WorkItemId) -> Advance {
        let Some(mut step) = self.items.get_mut(&id).and_then(|item| item.queue.pop()) else {
            return Advance::Nothing;
        };
        step.started_at = Some(Utc::now());
        ops::apply(&mut self.items, id, &step.ops);

        let Some(item) = self.items.get_mut(&id) else {
            return Advance::Nothing;
        };
        step.ended_at = Some(Utc::now());
        item.steps_completed += 1;
        item.history.push(step, StepOutcome::Completed);
        Advance::RanInline
    }

    fn dispatch(
        &mut self,
        id: WorkItemId,
        requirement: Requirement,
        resource: Option<ResourceId>,
    ) -> Advance {
        let Some(mut step) = self.items.get_mut(&id).and_then(|item| item.queue.pop()) else {
            release_resource(self.pool.as_mut(), id, resource);
            return Advance::Nothing;
        };
        step.resource = resource;
        step.started_at = Some(Utc::now());

        ops::apply(&mut self.items, id, &step.ops);

        let payload = match self.pending_payload(id, &step) {
            Some(payload) => payload,
            None => {
                // Item vanished mid-dispatch; nothing left to bind the slot to.
                release_slot(self.pool.as_mut(), id, &step);
                return Advance::Nothing;
            }
        };

        let job = DispatchJob {
            work_item: id,
            step: step.id,
            kind: step.kind,
            resource,
            payload,
            backend: Arc::clone(&self.backend),
            compiler: Arc::clone(&self.compiler),
            events: self.events_tx.clone(),
            poll_interval: self.config.poll_interval,
        };
        let (cancel, cancel_rx) = oneshot::channel();
        tokio::spawn(job.run(cancel_rx));

        let Some(item) = self.items.get_mut(&id) else {
            return Advance::Nothing;
        };
        info!(
            work_item = %id,
            workflow = %step.workflow,
            kind = %step.kind,
            ?requirement,
            resource = ?resource,
            "Step dispatched"
        );
        item.progress = None;
        item.in_flight = Some(InFlight {
            step,
            request_id: None,
            cancel,
        });
        set_state(item, WorkItemState::Dispatched, "step dispatched");
        Advance::Dispatched
    }

    fn pending_payload(&self, id: WorkItemId, step: &JobStep) -> Option<PendingPayload> {
        let item = self.items.get(&id)?;
        let payload = match step.kind {
            StepKind::RunWorkflow => PendingPayload::Workflow {
                template: step.template.clone().unwrap_or_else(|| step.workflow.clone()),
                bindings: item.vars.text_bindings(),
                seed: rand::random(),
            },
            StepKind::CallModel => PendingPayload::Ready(Payload::Chat {
                messages: item.prompt.to_messages(),
            }),
            StepKind::UploadAsset => {
                let spec = step.upload.as_ref()?;
                let source = ImageSlot::from_name(&spec.source).unwrap_or(ImageSlot::Image);
                let image = ops::read_image(&self.items, id, source).ok().flatten()?;
                PendingPayload::Upload {
                    name: format!("genqueue_{}_{}.png", id.0, Uuid::new_v4().simple()),
                    image,
                }
            }
            StepKind::Command => PendingPayload::Ready(Payload::Chat {
                messages: Vec::new(),
            }),
        };
        Some(payload)
    }
}

/// Split the head step's inline uploads into synthetic steps ahead of it.
fn materialize_uploads(item: &mut WorkItem) {
    let Some(head) = item.queue.peek_mut() else {
        return;
    };
    if head.uploads.is_empty() {
        return;
    }
    let uploads = std::mem::take(&mut head.uploads);
    let parent = head.clone();
    let synthetic: Vec<JobStep> = uploads
        .into_iter()
        .map(|spec| JobStep::synthetic_upload(&parent, spec))
        .collect();
    debug!(
        work_item = %item.id,
        workflow = %parent.workflow,
        count = synthetic.len(),
        "Materialized upload steps"
    );
    item.queue.insert_synthetic(synthetic);
}

fn release_slot(pool: &mut dyn ResourceAllocator, id: WorkItemId, step: &JobStep) {
    release_resource(pool, id, step.resource);
}

fn release_resource(pool: &mut dyn ResourceAllocator, id: WorkItemId, resource: Option<ResourceId>) {
    if let Some(resource) = resource {
        if let Err(e) = pool.release(resource) {
            warn!(work_item = %id, error = %e, "Slot release failed");
        }
    }
}

fn set_state(item: &mut WorkItem, state: WorkItemState, reason: &str) {
    if item.state == state {
        return;
    }
    if let Err(e) = item.transition_to(state, Some(reason.to_string())) {
        error!(work_item = %item.id, error = %e, "Invalid state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ResourceClass, ResourcePool};

    #[test]
    fn release_errors_are_logged_not_propagated() {
        let mut pool = ResourcePool::new();
        let gpu = pool.add_compute_backend("gpu0");
        pool.acquire(gpu).unwrap();

        release_resource(&mut pool, WorkItemId(1), Some(gpu));
        assert!(!pool.is_busy(gpu));

        // A second release is an integrity error; the pool stays usable.
        release_resource(&mut pool, WorkItemId(1), Some(gpu));
        release_resource(&mut pool, WorkItemId(1), None);
        assert!(!pool.is_busy(gpu));
        assert_eq!(
            pool.try_acquire_free(ResourceClass::ComputeBackend, None, None),
            Some(gpu)
        );
    }
}
