use std::sync::Arc;

use async_trait::async_trait;
use kiln_engine::{Built, NodeVisitor, WorkGraph};
use kiln_types::{NodeId, NodeResult};
use kiln_work::{NodeDescriptor, WorkExecutor};
use tokio_util::sync::CancellationToken;

/// Hands nodes picked by the scheduler to the [`WorkExecutor`].
///
/// Fingerprinting and actions block on the filesystem, so each visit runs on
/// tokio's blocking pool.
pub(crate) struct WorkVisitor {
    graph: Arc<WorkGraph<Built, NodeDescriptor>>,
    executor: Arc<WorkExecutor>,
}

impl WorkVisitor {
    pub(crate) fn new(
        graph: Arc<WorkGraph<Built, NodeDescriptor>>,
        executor: Arc<WorkExecutor>,
    ) -> Self {
        Self { graph, executor }
    }
}

#[async_trait]
impl NodeVisitor for WorkVisitor {
    async fn visit(&self, id: NodeId, cancel: CancellationToken) -> NodeResult {
        let Some(work) = self.graph.definition(&id).cloned() else {
            return NodeResult::failed(format!("no node named {id}"));
        };
        let executor = self.executor.clone();
        match tokio::task::spawn_blocking(move || executor.execute(&work, &cancel)).await {
            Ok(result) => result.into_node_result(),
            Err(e) => NodeResult::failed(format!("execution of {id} did not finish: {e}")),
        }
    }
}
