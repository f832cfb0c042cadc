//! Step queue owned by one work item.

use std::collections::VecDeque;

use super::step::JobStep;

/// Ordered pending steps for one work item.
///
/// Synthetic sub-steps (materialized uploads) always run before the live
/// queue. The queue is drained only when both are empty.
#[derive(Debug, Clone, Default)]
pub struct StepQueue {
    /// Applied to the variable store when a new drain cycle starts.
    seed: Option<JobStep>,
    synthetic: VecDeque<JobStep>,
    live: VecDeque<JobStep>,
}

impl StepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the starting step whose variable operations seed each cycle.
    pub fn set_seed(&mut self, seed: JobStep) {
        self.seed = Some(seed);
    }

    pub fn seed(&self) -> Option<&JobStep> {
        self.seed.as_ref()
    }

    /// Append a step to the live queue.
    pub fn push(&mut self, step: JobStep) {
        self.live.push_back(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = JobStep>) {
        self.live.extend(steps);
    }

    /// Insert synthetic steps ahead of everything else, keeping their order.
    pub fn insert_synthetic(&mut self, steps: Vec<JobStep>) {
        for step in steps.into_iter().rev() {
            self.synthetic.push_front(step);
        }
    }

    /// Put a step back at the head of the queue it came from.
    pub fn push_front(&mut self, step: JobStep) {
        if step.is_synthetic() {
            self.synthetic.push_front(step);
        } else {
            self.live.push_front(step);
        }
    }

    /// Next step to run.
    pub fn peek(&self) -> Option<&JobStep> {
        self.synthetic.front().or_else(|| self.live.front())
    }

    pub fn peek_mut(&mut self) -> Option<&mut JobStep> {
        match self.synthetic.front_mut() {
            Some(step) => Some(step),
            None => self.live.front_mut(),
        }
    }

    /// Remove and return the next step to run.
    pub fn pop(&mut self) -> Option<JobStep> {
        self.synthetic.pop_front().or_else(|| self.live.pop_front())
    }

    /// Drop every pending step, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.synthetic.len() + self.live.len();
        self.synthetic.clear();
        self.live.clear();
        dropped
    }

    pub fn is_drained(&self) -> bool {
        self.synthetic.is_empty() && self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.synthetic.len() + self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_drained()
    }

    pub fn synthetic_len(&self) -> usize {
        self.synthetic.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::step::{StepTemplate, UploadSpec};

    fn step(name: &str) -> JobStep {
        JobStep::from_template(&StepTemplate::workflow(name, format!("{name}.json")), 0)
    }

    #[test]
    fn synthetic_steps_run_first_in_order() {
        let mut queue = StepQueue::new();
        queue.push(step("a"));
        queue.push(step("b"));

        let parent = queue.peek().cloned().unwrap();
        let uploads = vec![
            JobStep::synthetic_upload(&parent, UploadSpec { source: "image".into(), input: 1 }),
            JobStep::synthetic_upload(&parent, UploadSpec { source: "mask".into(), input: 2 }),
        ];
        queue.insert_synthetic(uploads);

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.synthetic_len(), 2);
        assert_eq!(queue.pop().unwrap().upload.unwrap().input, 1);
        assert_eq!(queue.pop().unwrap().upload.unwrap().input, 2);
        assert_eq!(queue.pop().unwrap().workflow, "a");
        assert_eq!(queue.pop().unwrap().workflow, "b");
        assert!(queue.is_drained());
    }

    #[test]
    fn not_drained_while_synthetic_pending() {
        let mut queue = StepQueue::new();
        let parent = step("a");
        queue.insert_synthetic(vec![JobStep::synthetic_upload(
            &parent,
            UploadSpec { source: "image".into(), input: 1 },
        )]);
        assert!(!queue.is_drained());
        queue.pop();
        assert!(queue.is_drained());
    }

    #[test]
    fn push_front_returns_step_to_its_queue() {
        let mut queue = StepQueue::new();
        queue.push(step("a"));
        queue.push(step("b"));
        let first = queue.pop().unwrap();
        queue.push_front(first);
        assert_eq!(queue.peek().unwrap().workflow, "a");
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut queue = StepQueue::new();
        queue.extend([step("a"), step("b"), step("c")]);
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
    }
}
