//! Per-work-item archive of finished steps.

use std::collections::VecDeque;

use serde::Serialize;

use crate::steps::JobStep;

/// How an archived step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// One archived step with its assignment and timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub step: JobStep,
    pub outcome: StepOutcome,
}

/// Archived steps in the order they finished. Oldest entries are dropped
/// once `limit` is reached.
#[derive(Debug, Clone)]
pub struct JobHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl JobHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, step: JobStep, outcome: StepOutcome) {
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { step, outcome });
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
