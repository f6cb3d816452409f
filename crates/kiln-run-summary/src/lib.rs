//! What happened during a run: per-node outcomes, totals, and for every
//! skipped node the chain of skips leading back to the failure that caused
//! it. Printed to the console and saved as JSON.

#[macro_use]
mod ui;
mod duration;
mod execution;

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{self, Write},
};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
pub use duration::KilnDuration;
pub use execution::{ExecutionSummary, ExecutionTracker};
use kiln_types::{NodeCompletion, NodeId, NodeState, SkipReason, WorkOutcome};
use serde::Serialize;
use svix_ksuid::Ksuid;
use thiserror::Error;
use tracing::warn;
pub use ui::UI;

use crate::ui::{BOLD, BOLD_GREEN, BOLD_RED, GREY, YELLOW};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to write run summary: {0}")]
    IO(#[from] std::io::Error),
    #[error("failed to serialize run summary to JSON")]
    Serde(#[from] serde_json::Error),
}

// Bump when the shape of the JSON record changes.
const RUN_SUMMARY_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: NodeId,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkOutcome>,
    pub reasons: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<SkipReason>,
    /// For skipped nodes, the nodes that were skipped or failed before this
    /// one, ending with the origin.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub causal_chain: Vec<NodeId>,
}

impl NodeSummary {
    fn new(completion: &NodeCompletion, causal_chain: Vec<NodeId>) -> Self {
        Self {
            id: completion.id.clone(),
            state: completion.state,
            outcome: completion.outcome,
            reasons: completion.reasons.clone(),
            duration_ms: u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX),
            failure: completion.failure.clone(),
            skipped_because: completion.skipped_because.clone(),
            causal_chain,
        }
    }

    /// The node at the end of the causal chain.
    pub fn origin(&self) -> Option<&NodeId> {
        self.causal_chain.last()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    id: Ksuid,
    version: String,
    execution: ExecutionSummary,
    nodes: Vec<NodeSummary>,
}

impl RunSummary {
    /// Summarizes everything `tracker` has seen.
    pub fn new(
        id: Ksuid,
        tracker: &ExecutionTracker,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
    ) -> Self {
        let state = tracker.snapshot();
        Self::from_completions(id, state.attempted, &state.completions, start_time, end_time)
    }

    pub(crate) fn from_completions(
        id: Ksuid,
        attempted: usize,
        completions: &BTreeMap<NodeId, NodeCompletion>,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
    ) -> Self {
        let execution =
            ExecutionSummary::new(attempted, completions.values(), start_time, end_time);
        let nodes = completions
            .values()
            .map(|completion| NodeSummary::new(completion, causal_chain(completion, completions)))
            .collect();
        Self {
            id,
            version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            execution,
            nodes,
        }
    }

    pub fn id(&self) -> &Ksuid {
        &self.id
    }

    pub fn execution(&self) -> &ExecutionSummary {
        &self.execution
    }

    /// Sorted by node id.
    pub fn nodes(&self) -> &[NodeSummary] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|node| node.id.as_str() == id)
    }

    pub fn failed_nodes(&self) -> impl Iterator<Item = &NodeSummary> {
        self.nodes
            .iter()
            .filter(|node| node.state == NodeState::Failed)
    }

    pub fn exit_code(&self) -> i32 {
        self.execution.exit_code
    }

    pub fn print(&self, ui: UI) -> Result<(), Error> {
        if self.execution.attempted == 0 {
            warn!("No nodes were executed as a part of this run.");
        }
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out)?;
        self.write_text(&mut out, ui)?;
        writeln!(out)?;
        Ok(())
    }

    /// One line per node, then the totals.
    pub fn write_text(&self, out: &mut impl Write, ui: UI) -> io::Result<()> {
        for node in &self.nodes {
            let status = match (node.state, node.outcome) {
                (NodeState::Failed, _) => color!(ui, BOLD_RED, "FAILED"),
                (NodeState::Skipped, _) => color!(ui, YELLOW, "SKIPPED"),
                (_, Some(WorkOutcome::Executed)) => color!(ui, BOLD_GREEN, "EXECUTED"),
                (_, Some(outcome)) => color!(ui, GREY, "{}", outcome),
                (state, None) => color!(ui, GREY, "{}", state),
            };
            let detail = match (&node.failure, &node.skipped_because) {
                (Some(failure), _) => Some(failure.clone()),
                (None, Some(reason)) => Some(match node.origin() {
                    Some(origin) if node.causal_chain.len() > 1 => {
                        format!("{reason}, caused by {origin}")
                    }
                    _ => reason.to_string(),
                }),
                (None, None) => node.reasons.first().cloned(),
            };
            match detail {
                Some(detail) => writeln!(out, "{}: {status} ({detail})", node.id)?,
                None => writeln!(out, "{}: {status}", node.id)?,
            }
        }
        writeln!(out)?;

        let execution = &self.execution;
        let mut line_data = vec![
            (
                "Nodes",
                format!(
                    "{}, {} total",
                    color!(ui, BOLD_GREEN, "{} successful", execution.successful()),
                    self.nodes.len()
                ),
            ),
            (
                "Results",
                format!(
                    "{} executed, {} up-to-date, {} from cache",
                    execution.executed, execution.up_to_date, execution.from_cache
                ),
            ),
            ("Time", color!(ui, BOLD, "{}", execution.duration).to_string()),
        ];

        let failed: Vec<_> = self
            .failed_nodes()
            .map(|node| color!(ui, BOLD_RED, "{}", node.id).to_string())
            .collect();
        if !failed.is_empty() {
            line_data.push(("Failed", failed.join(", ")));
        }
        if execution.skipped > 0 {
            line_data.push(("Skipped", format!("{} skipped", execution.skipped)));
        }

        let max_length = line_data
            .iter()
            .map(|(header, _)| header.len())
            .max()
            .unwrap_or_default();
        for (header, trailer) in line_data {
            writeln!(
                out,
                "{}",
                color!(
                    ui,
                    BOLD,
                    "{}{}:    {}",
                    " ".repeat(max_length - header.len()),
                    header,
                    trailer
                )
            )?;
        }
        Ok(())
    }

    /// `<dir>/<id>.json`
    pub fn path(&self, dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(format!("{}.json", self.id))
    }

    pub fn save(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, Error> {
        let json = serde_json::to_string_pretty(self)?;
        let path = self.path(dir);
        fs::create_dir_all(dir)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Follows skip reasons from `completion` back to the node that started it.
fn causal_chain(
    completion: &NodeCompletion,
    completions: &BTreeMap<NodeId, NodeCompletion>,
) -> Vec<NodeId> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(completion);
    while let Some(completion) = current {
        let next = match &completion.skipped_because {
            Some(SkipReason::DependencyFailed { dependency }) => dependency,
            Some(SkipReason::BuildStopped { failed }) => failed,
            _ => break,
        };
        if !seen.insert(next.clone()) {
            break;
        }
        chain.push(next.clone());
        current = completions.get(next);
    }
    chain
}
