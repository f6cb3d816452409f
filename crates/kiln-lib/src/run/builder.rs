use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_cache::{BuildCache, FsCache, NoopCache};
use kiln_engine::{Built, WorkGraph};
use kiln_history::{FsHistoryStore, HistoryStore};
use kiln_types::CompletionListener;
use kiln_work::NodeDescriptor;
use kiln_workspace::{CleanupPolicy, WorkspaceProvider};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Run;
use crate::{config::ConfigurationOptions, Error};

/// Assembles a [`Run`] from a finished graph and its collaborators.
///
/// Collaborators that are not supplied are created from the configuration,
/// with relative directories resolved against `root`.
pub struct RunBuilder {
    root: Utf8PathBuf,
    config: ConfigurationOptions,
    history: Option<Arc<dyn HistoryStore>>,
    cache: Option<Arc<dyn BuildCache>>,
    workspaces: Option<Arc<WorkspaceProvider>>,
    listeners: Vec<Arc<dyn CompletionListener>>,
    cancel: Option<CancellationToken>,
}

impl RunBuilder {
    pub fn new(root: &Utf8Path, config: ConfigurationOptions) -> Self {
        Self {
            root: root.to_owned(),
            config,
            history: None,
            cache: None,
            workspaces: None,
            listeners: Vec::new(),
            cancel: None,
        }
    }

    pub fn with_history_store(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn BuildCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_workspace_provider(mut self, workspaces: Arc<WorkspaceProvider>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    /// Adds a listener that sees every node event of every execution.
    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Uses `cancel` to stop executions, typically the token of a
    /// [`SignalHandler`](crate::signal::SignalHandler).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self, graph: WorkGraph<Built, NodeDescriptor>) -> Result<Run, Error> {
        let history: Arc<dyn HistoryStore> = match self.history {
            Some(history) => history,
            None => {
                let dir = self.root.join(self.config.history_dir());
                debug!("using execution history at {dir}");
                Arc::new(FsHistoryStore::new(&dir)?)
            }
        };

        let cache: Arc<dyn BuildCache> = match self.cache {
            Some(cache) => cache,
            None if self.config.cache().is_disabled() => Arc::new(NoopCache),
            None => {
                let dir = self.root.join(self.config.cache_dir());
                debug!("using build cache at {dir}");
                Arc::new(FsCache::new(&dir)?)
            }
        };

        let workspaces = match self.workspaces {
            Some(workspaces) => workspaces,
            None => {
                let policy = CleanupPolicy {
                    max_age: self.config.workspace_max_age(),
                    max_entries: self.config.workspace_max_entries(),
                    ..Default::default()
                };
                Arc::new(WorkspaceProvider::new(
                    &self.root.join(self.config.workspace_dir()),
                    policy,
                )?)
            }
        };

        Ok(Run {
            root: self.root,
            config: self.config,
            graph: Arc::new(graph),
            history,
            cache,
            workspaces,
            listeners: self.listeners,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}
