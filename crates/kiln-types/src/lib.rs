//! Shared types for kiln
//!
//! This crate contains types that are used across multiple crates in the
//! kiln workspace. It serves as a foundation layer to avoid circular
//! dependencies between the engine, the work pipeline and the run summary.

use std::{borrow::Borrow, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// Stable identity of a unit of work.
///
/// Identities are compared lexicographically. Whenever the engine needs a
/// deterministic tie-break (cycle reports, dispatch order, dropped soft
/// edges) it uses this ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Classification of how a node reached a successful or failed end state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOutcome {
    /// Inputs and outputs matched the previous execution, nothing ran.
    UpToDate,
    /// Outputs were restored from the build cache.
    FromCache,
    /// The node's action ran.
    Executed,
    /// The node's action or its fingerprinting failed.
    Failed,
}

impl WorkOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, WorkOutcome::Failed)
    }
}

impl fmt::Display for WorkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkOutcome::UpToDate => "UP-TO-DATE",
            WorkOutcome::FromCache => "FROM-CACHE",
            WorkOutcome::Executed => "EXECUTED",
            WorkOutcome::Failed => "FAILED",
        })
    }
}

/// Scheduler-owned lifecycle of a node.
///
/// `Pending -> Queued -> Executing -> {Executed | Failed | Skipped}`. A node
/// that never leaves `Pending` or `Queued` ends up `Skipped`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Pending,
    Queued,
    Executing,
    Executed,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Executed | NodeState::Failed | NodeState::Skipped
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Pending => "pending",
            NodeState::Queued => "queued",
            NodeState::Executing => "executing",
            NodeState::Executed => "executed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
        })
    }
}

/// Why a node was never executed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SkipReason {
    /// A hard dependency failed or was itself skipped.
    DependencyFailed { dependency: NodeId },
    /// Fail-fast mode stopped dispatch after `failed` failed.
    BuildStopped { failed: NodeId },
    /// The run was cancelled before the node started.
    Cancelled,
    /// A finalizer whose finalized nodes never ran.
    NothingToFinalize,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency failed: {dependency}")
            }
            SkipReason::BuildStopped { failed } => {
                write!(f, "build stopped after failure of {failed}")
            }
            SkipReason::Cancelled => f.write_str("cancelled"),
            SkipReason::NothingToFinalize => f.write_str("nothing to finalize"),
        }
    }
}

impl SkipReason {
    /// Whether nodes depending on the skipped node must be skipped too.
    /// Only skips caused by a failure or by stopping the run propagate.
    pub fn blocks_dependents(&self) -> bool {
        match self {
            SkipReason::DependencyFailed { .. }
            | SkipReason::BuildStopped { .. }
            | SkipReason::Cancelled => true,
            SkipReason::NothingToFinalize => false,
        }
    }
}

/// How the scheduler reacts to a failed node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContinueMode {
    /// Keep running every node that does not depend on a failure.
    #[default]
    Always,
    /// Fail fast: dispatch nothing new after the first failure.
    Never,
}

impl fmt::Display for ContinueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContinueMode::Always => "always",
            ContinueMode::Never => "never",
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAccess {
    Exclusive,
    Shared,
}

/// A claim on a named resource held for the duration of a node's execution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub name: String,
    pub access: ResourceAccess,
}

impl ResourceClaim {
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: ResourceAccess::Exclusive,
        }
    }

    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: ResourceAccess::Shared,
        }
    }
}

/// What kind of unit of work a node is.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Writes its outputs in place; outputs may be modified between runs.
    #[default]
    Task,
    /// Produces immutable outputs in a workspace keyed by its identity.
    Transform,
}

impl NodeKind {
    pub fn is_immutable(&self) -> bool {
        matches!(self, NodeKind::Transform)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::Task => "task",
            NodeKind::Transform => "transform",
        })
    }
}

/// What a visitor reports back after handling one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeResult {
    pub outcome: WorkOutcome,
    pub reasons: Vec<String>,
    pub failure: Option<String>,
}

impl NodeResult {
    pub fn success(outcome: WorkOutcome, reasons: Vec<String>) -> Self {
        Self {
            outcome,
            reasons,
            failure: None,
        }
    }

    pub fn failed(failure: impl Into<String>) -> Self {
        Self {
            outcome: WorkOutcome::Failed,
            reasons: Vec::new(),
            failure: Some(failure.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Terminal record of one node in an execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCompletion {
    pub id: NodeId,
    /// One of the terminal states.
    pub state: NodeState,
    /// Set for nodes that were visited, `None` for skipped nodes.
    pub outcome: Option<WorkOutcome>,
    pub reasons: Vec<String>,
    pub duration: Duration,
    /// Error message of a failed node, kept verbatim.
    pub failure: Option<String>,
    pub skipped_because: Option<SkipReason>,
}

impl NodeCompletion {
    pub fn visited(id: NodeId, result: NodeResult, duration: Duration) -> Self {
        let state = if result.is_success() {
            NodeState::Executed
        } else {
            NodeState::Failed
        };
        Self {
            id,
            state,
            outcome: Some(result.outcome),
            reasons: result.reasons,
            duration,
            failure: result.failure,
            skipped_because: None,
        }
    }

    pub fn skipped(id: NodeId, reason: SkipReason) -> Self {
        Self {
            id,
            state: NodeState::Skipped,
            outcome: None,
            reasons: Vec::new(),
            duration: Duration::ZERO,
            failure: None,
            skipped_because: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == NodeState::Executed
    }
}

/// Receives node lifecycle events as an execution progresses.
pub trait CompletionListener: Send + Sync {
    fn node_started(&self, _id: &NodeId) {}

    fn node_completed(&self, completion: &NodeCompletion);
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test]
    fn node_ids_order_lexicographically() {
        let mut ids = vec![NodeId::new("test"), NodeId::new("compile"), NodeId::new("jar")];
        ids.sort();
        let ids: Vec<_> = ids.iter().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["compile", "jar", "test"]);
    }

    #[test]
    fn node_id_serializes_as_string() {
        let id = NodeId::new(":app:compile");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\":app:compile\"");
        let back: NodeId = serde_json::from_str("\":app:compile\"").unwrap();
        assert_eq!(back, id);
    }

    #[test_case(NodeState::Pending, false)]
    #[test_case(NodeState::Queued, false)]
    #[test_case(NodeState::Executing, false)]
    #[test_case(NodeState::Executed, true)]
    #[test_case(NodeState::Failed, true)]
    #[test_case(NodeState::Skipped, true)]
    fn terminal_states(state: NodeState, terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn skip_reason_display() {
        let reason = SkipReason::DependencyFailed {
            dependency: NodeId::new("compile"),
        };
        assert_eq!(reason.to_string(), "dependency failed: compile");
        assert_eq!(ContinueMode::default(), ContinueMode::Always);
    }

    #[test_case(SkipReason::DependencyFailed { dependency: NodeId::new("compile") }, true ; "dependency failed")]
    #[test_case(SkipReason::BuildStopped { failed: NodeId::new("compile") }, true ; "build stopped")]
    #[test_case(SkipReason::Cancelled, true ; "cancelled")]
    #[test_case(SkipReason::NothingToFinalize, false ; "nothing to finalize")]
    fn skips_that_block_dependents(reason: SkipReason, blocks: bool) {
        assert_eq!(reason.blocks_dependents(), blocks);
    }

    #[test]
    fn completion_state_follows_outcome() {
        let ok = NodeCompletion::visited(
            NodeId::new("compile"),
            NodeResult::success(WorkOutcome::UpToDate, vec![]),
            Duration::from_millis(5),
        );
        assert_eq!(ok.state, NodeState::Executed);
        assert!(ok.is_success());

        let failed = NodeCompletion::visited(
            NodeId::new("test"),
            NodeResult::failed("2 tests failed"),
            Duration::ZERO,
        );
        assert_eq!(failed.state, NodeState::Failed);
        assert_eq!(failed.failure.as_deref(), Some("2 tests failed"));

        let skipped = NodeCompletion::skipped(NodeId::new("jar"), SkipReason::Cancelled);
        assert_eq!(skipped.outcome, None);
        assert!(!skipped.is_success());
    }
}
