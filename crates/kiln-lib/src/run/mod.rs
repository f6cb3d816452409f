mod builder;
mod visitor;

use std::sync::Arc;

pub use builder::RunBuilder;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use kiln_cache::BuildCache;
use kiln_engine::{Built, ExecutionOptions, FilteredView, Scheduler, WorkGraph};
use kiln_history::HistoryStore;
use kiln_run_summary::{ExecutionTracker, RunSummary};
use kiln_snapshot::SnapshotCache;
use kiln_types::{CompletionListener, NodeId};
use kiln_work::{CacheSettings, NodeDescriptor, WorkExecutor};
use kiln_workspace::WorkspaceProvider;
use svix_ksuid::{Ksuid, KsuidLike};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use visitor::WorkVisitor;

use crate::{config::ConfigurationOptions, Error};

/// Where run summaries are written when enabled, relative to the root.
pub const RUNS_DIR: &str = ".kiln/runs";

/// A finished work graph and everything needed to execute it.
///
/// Each call to [`run`](Self::run) is a separate build invocation with its
/// own id and its own snapshot cache. History, build cache and workspaces
/// persist across invocations.
pub struct Run {
    root: Utf8PathBuf,
    config: ConfigurationOptions,
    graph: Arc<WorkGraph<Built, NodeDescriptor>>,
    history: Arc<dyn HistoryStore>,
    cache: Arc<dyn BuildCache>,
    workspaces: Arc<WorkspaceProvider>,
    listeners: Vec<Arc<dyn CompletionListener>>,
    cancel: CancellationToken,
}

impl Run {
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn graph(&self) -> &WorkGraph<Built, NodeDescriptor> {
        &self.graph
    }

    /// Cancelling this token stops every later dispatch, including those of
    /// future invocations.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Brings `requested` and everything they need up to date, leaving out
    /// `excluded`.
    ///
    /// With nothing requested every node is a candidate. Nodes that only
    /// finalize others still run only alongside something they finalize.
    pub async fn run(
        &self,
        requested: &[NodeId],
        excluded: &[NodeId],
    ) -> Result<RunSummary, Error> {
        let id = Ksuid::new(None, None);
        let start_time = Local::now();

        let view = self.view(requested, excluded);
        info!(invocation = %id, "executing {} of {} nodes", view.len(), self.graph.len());
        for (from, to) in self.graph.dropped_soft_edges() {
            debug!("ignoring should-run-after from {from} to {to} to break a cycle");
        }

        let executor = WorkExecutor::new(
            id.to_string(),
            self.history.clone(),
            self.cache.clone(),
            self.workspaces.clone(),
            Arc::new(SnapshotCache::new()),
        )
        .with_cache_settings(self.cache_settings());
        let visitor = Arc::new(WorkVisitor::new(self.graph.clone(), Arc::new(executor)));

        let tracker = Arc::new(ExecutionTracker::new());
        let scheduler = self.listeners.iter().fold(
            Scheduler::new(self.execution_options())
                .with_listener(tracker.clone())
                .with_cancellation(self.cancel.clone()),
            |scheduler, listener| scheduler.with_listener(listener.clone()),
        );

        let report = scheduler.execute(&view, visitor).await?;
        debug!("execution finished with {} failures", report.failed().count());

        let summary = RunSummary::new(id, &tracker, start_time, Local::now());
        if self.config.run_summary() {
            match summary.save(&self.root.join(RUNS_DIR)) {
                Ok(path) => info!("saved run summary to {path}"),
                Err(e) => warn!("failed to save run summary: {e}"),
            }
        }
        Ok(summary)
    }

    fn view(&self, requested: &[NodeId], excluded: &[NodeId]) -> FilteredView<'_, NodeDescriptor> {
        match (requested.is_empty(), excluded.is_empty()) {
            (true, true) => self.graph.full_view(),
            (true, false) => {
                let roots: Vec<NodeId> = self
                    .graph
                    .node_ids()
                    .into_iter()
                    .filter(|id| {
                        self.graph
                            .finalized_by(id)
                            .map_or(true, |finalized| finalized.is_empty())
                    })
                    .cloned()
                    .collect();
                self.graph.filter(&roots, excluded)
            }
            (false, _) => self.graph.filter(requested, excluded),
        }
    }

    fn execution_options(&self) -> ExecutionOptions {
        self.config.resource_capacities().into_iter().fold(
            ExecutionOptions::new(self.config.concurrency(), self.config.continue_mode()),
            |options, (resource, capacity)| options.with_resource_capacity(resource, capacity),
        )
    }

    fn cache_settings(&self) -> CacheSettings {
        let cache = self.config.cache();
        CacheSettings {
            read: cache.read,
            write: cache.write,
        }
    }
}
