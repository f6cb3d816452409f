use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Local};
use kiln_types::{CompletionListener, NodeCompletion, NodeId, NodeState, SkipReason, WorkOutcome};
use serde::Serialize;

use crate::duration::KilnDuration;

/// Exit code of a run that was interrupted, as a shell reports SIGINT.
const CANCELLED_EXIT_CODE: i32 = 130;

/// Collects node events as a run progresses.
///
/// Registered with the scheduler as a [`CompletionListener`]. Events arrive
/// from the coordinator only, so the lock is never contended for long.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct TrackerState {
    pub(crate) attempted: usize,
    pub(crate) completions: BTreeMap<NodeId, NodeCompletion>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub(crate) fn snapshot(&self) -> TrackerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CompletionListener for ExecutionTracker {
    fn node_started(&self, _id: &NodeId) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempted += 1;
    }

    fn node_completed(&self, completion: &NodeCompletion) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completions
            .insert(completion.id.clone(), completion.clone());
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    // nodes whose action ran
    pub executed: usize,
    pub up_to_date: usize,
    pub from_cache: usize,
    pub failed: usize,
    pub skipped: usize,
    // nodes handed to a worker
    pub attempted: usize,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(skip)]
    pub duration: KilnDuration,
    pub exit_code: i32,
}

impl ExecutionSummary {
    pub(crate) fn new<'a>(
        attempted: usize,
        completions: impl IntoIterator<Item = &'a NodeCompletion>,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
    ) -> Self {
        let mut summary = Self {
            executed: 0,
            up_to_date: 0,
            from_cache: 0,
            failed: 0,
            skipped: 0,
            attempted,
            start_time: start_time.timestamp_millis(),
            end_time: end_time.timestamp_millis(),
            duration: KilnDuration::new(&start_time, &end_time),
            exit_code: 0,
        };
        let mut cancelled = false;
        for completion in completions {
            match (completion.state, completion.outcome) {
                (NodeState::Skipped, _) => {
                    summary.skipped += 1;
                    cancelled |= completion.skipped_because == Some(SkipReason::Cancelled);
                }
                (NodeState::Failed, _) | (_, Some(WorkOutcome::Failed)) => summary.failed += 1,
                (_, Some(WorkOutcome::Executed)) => summary.executed += 1,
                (_, Some(WorkOutcome::UpToDate)) => summary.up_to_date += 1,
                (_, Some(WorkOutcome::FromCache)) => summary.from_cache += 1,
                (_, None) => {}
            }
        }
        summary.exit_code = if summary.failed > 0 {
            1
        } else if cancelled {
            CANCELLED_EXIT_CODE
        } else {
            0
        };
        summary
    }

    pub fn successful(&self) -> usize {
        self.executed + self.up_to_date + self.from_cache
    }
}
