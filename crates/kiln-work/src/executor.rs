use std::{
    collections::BTreeMap,
    fs, io,
    sync::Arc,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use kiln_cache::{BuildCache, OutputBundle};
use kiln_history::{HistoryEntry, HistoryStore};
use kiln_snapshot::{Fingerprint, InputFingerprinter, SnapshotCache};
use kiln_types::{NodeId, NodeKind, NodeResult, WorkOutcome};
use kiln_workspace::{ImmutableWorkspaceMetadata, Verification, Workspace, WorkspaceProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{ActionContext, DecisionEngine, Error, NodeDescriptor, WorkDecision};

/// Whether the build cache is consulted and filled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub read: bool,
    pub write: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// How one node's execution ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkResult {
    pub decision: WorkDecision,
    pub duration: Duration,
    /// Error message of a failed node, verbatim.
    pub failure: Option<String>,
}

impl WorkResult {
    pub fn into_node_result(self) -> NodeResult {
        NodeResult {
            outcome: self.decision.outcome,
            reasons: self.decision.reasons,
            failure: self.failure,
        }
    }
}

/// Runs single nodes: fingerprint, decide, then restore or execute and
/// record.
///
/// One executor serves one build invocation. Its snapshot cache must not
/// outlive the invocation since files change between builds.
pub struct WorkExecutor {
    invocation_id: String,
    history: Arc<dyn HistoryStore>,
    cache: Arc<dyn BuildCache>,
    cache_settings: CacheSettings,
    workspaces: Arc<WorkspaceProvider>,
    snapshots: Arc<SnapshotCache>,
}

impl WorkExecutor {
    pub fn new(
        invocation_id: impl Into<String>,
        history: Arc<dyn HistoryStore>,
        cache: Arc<dyn BuildCache>,
        workspaces: Arc<WorkspaceProvider>,
        snapshots: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            history,
            cache,
            cache_settings: CacheSettings::default(),
            workspaces,
            snapshots,
        }
    }

    pub fn with_cache_settings(mut self, cache_settings: CacheSettings) -> Self {
        self.cache_settings = cache_settings;
        self
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Brings `work` up to date. Never fails as such: errors end up in
    /// [`WorkResult::failure`].
    #[instrument(skip_all, fields(node = %work.id))]
    pub fn execute(&self, work: &NodeDescriptor, cancel: &CancellationToken) -> WorkResult {
        let start = Instant::now();
        let mut execution = Execution {
            executor: self,
            work,
            cancel,
            decision: None,
        };
        let result = match work.kind {
            NodeKind::Task => execution.run_task(),
            NodeKind::Transform => execution.run_transform(),
        };
        let duration = start.elapsed();

        match result {
            Ok(decision) => {
                debug!("{} finished as {}", work.id, decision.outcome);
                WorkResult {
                    decision,
                    duration,
                    failure: None,
                }
            }
            Err(error) => {
                let reasons = execution
                    .decision
                    .map(|decision| decision.reasons)
                    .unwrap_or_default();
                WorkResult {
                    decision: WorkDecision {
                        outcome: WorkOutcome::Failed,
                        reasons,
                        cache_key: String::new(),
                    },
                    duration,
                    failure: Some(error.to_string()),
                }
            }
        }
    }

    fn load_history(&self, identity: &NodeId) -> Option<HistoryEntry> {
        match self.history.load(identity) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("ignoring execution history of {identity}: {e}");
                None
            }
        }
    }

    fn forget(&self, identity: &NodeId) {
        if let Err(e) = self.history.remove(identity) {
            warn!("failed to remove execution history of {identity}: {e}");
        }
    }

    fn invalidate(&self, outputs: &BTreeMap<String, Vec<Utf8PathBuf>>) {
        for path in outputs.values().flatten() {
            self.snapshots.invalidate(path);
        }
    }
}

/// State of one node passing through the executor.
struct Execution<'a> {
    executor: &'a WorkExecutor,
    work: &'a NodeDescriptor,
    cancel: &'a CancellationToken,
    /// Latest decision, kept so a failure can still report why work ran.
    decision: Option<WorkDecision>,
}

impl<'a> Execution<'a> {
    fn run_task(&mut self) -> Result<WorkDecision, Error> {
        let root = self.work.root.clone();
        let outputs = self.work.resolved_outputs(&root);
        self.run(&root, &outputs, None)
    }

    fn run_transform(&mut self) -> Result<WorkDecision, Error> {
        let executor = self.executor;
        executor
            .workspaces
            .with_workspace(&self.work.id, |workspace| {
                let anchor = workspace.outputs_dir();
                let outputs = self.work.resolved_outputs(&anchor);
                self.run(&anchor, &outputs, Some(workspace))
            })?
    }

    fn run(
        &mut self,
        anchor: &Utf8Path,
        outputs: &BTreeMap<String, Vec<Utf8PathBuf>>,
        workspace: Option<&Workspace>,
    ) -> Result<WorkDecision, Error> {
        let executor = self.executor;
        let fingerprinter = InputFingerprinter::new(&executor.snapshots);
        let inputs = fingerprinter.fingerprint_inputs(&self.work.resolved_inputs())?;
        let previous = executor.load_history(&self.work.id);
        let current_outputs = fingerprinter.fingerprint_outputs(outputs)?;

        let mut decision = DecisionEngine::new(
            executor.cache.as_ref(),
            executor.cache_settings.read,
        )
        .decide(self.work, &inputs, &current_outputs, previous.as_ref());

        if let Some(workspace) = workspace {
            if let Some(modified) = tampered_properties(workspace, &current_outputs) {
                warn!(
                    "outputs of {} were modified after they were created, rebuilding",
                    self.work.id
                );
                decision = WorkDecision {
                    outcome: WorkOutcome::Executed,
                    reasons: vec![format!(
                        "immutable outputs were modified after creation: {}",
                        modified.join(", ")
                    )],
                    cache_key: decision.cache_key,
                };
            }
        }
        self.decision = Some(decision.clone());

        let outcome = decision.outcome;
        match outcome {
            WorkOutcome::UpToDate => return Ok(decision),
            WorkOutcome::FromCache => match self.restore(anchor, outputs, &inputs, &decision, workspace)
            {
                Ok(true) => return Ok(decision),
                Ok(false) => {
                    decision = decision.into_executed("build cache entry is gone, executing");
                }
                Err(e) => {
                    warn!("failed to restore {} from the build cache: {e}", self.work.id);
                    decision = decision.into_executed("restoring from the build cache failed");
                }
            },
            WorkOutcome::Executed | WorkOutcome::Failed => {}
        }
        self.decision = Some(decision.clone());

        self.execute_action(anchor, outputs, &inputs, decision, workspace)
    }

    /// Replaces the declared outputs with the cached bundle.
    fn restore(
        &self,
        anchor: &Utf8Path,
        outputs: &BTreeMap<String, Vec<Utf8PathBuf>>,
        inputs: &BTreeMap<String, Fingerprint>,
        decision: &WorkDecision,
        workspace: Option<&Workspace>,
    ) -> Result<bool, Error> {
        match workspace {
            Some(workspace) => workspace.clear()?,
            None => remove_outputs(outputs)?,
        }
        self.executor.invalidate(outputs);

        let Some(hit) = self.executor.cache.try_load(&decision.cache_key, anchor)? else {
            return Ok(false);
        };
        debug!(
            "restored {} files of {} from the build cache",
            hit.restored_files.len(),
            self.work.id
        );
        self.record(outputs, inputs, decision, hit.time_saved_ms, workspace)?;
        Ok(true)
    }

    fn execute_action(
        &self,
        anchor: &Utf8Path,
        outputs: &BTreeMap<String, Vec<Utf8PathBuf>>,
        inputs: &BTreeMap<String, Fingerprint>,
        decision: WorkDecision,
        workspace: Option<&Workspace>,
    ) -> Result<WorkDecision, Error> {
        // Mutable outputs stay in place for the action; a workspace starts
        // empty.
        if let Some(workspace) = workspace {
            workspace.clear()?;
            self.executor.invalidate(outputs);
        }

        let start = Instant::now();
        let context = ActionContext {
            id: &self.work.id,
            working_dir: anchor,
            outputs,
            cancel: self.cancel,
        };
        let result = self.work.action.execute(&context);
        self.executor.invalidate(outputs);
        if let Err(e) = result {
            // Half-written outputs must never look up to date.
            self.executor.forget(&self.work.id);
            return Err(e.into());
        }
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.record(outputs, inputs, &decision, duration_ms, workspace)?;

        let settings = self.executor.cache_settings;
        if self.work.cacheable && settings.write {
            self.store_in_cache(anchor, outputs, &decision.cache_key, duration_ms);
        }
        Ok(decision)
    }

    /// Fingerprints the outputs now on disk and stores them as the new
    /// history entry.
    fn record(
        &self,
        outputs: &BTreeMap<String, Vec<Utf8PathBuf>>,
        inputs: &BTreeMap<String, Fingerprint>,
        decision: &WorkDecision,
        duration_ms: u64,
        workspace: Option<&Workspace>,
    ) -> Result<(), Error> {
        let executor = self.executor;
        let output_fingerprints =
            InputFingerprinter::new(&executor.snapshots).fingerprint_outputs(outputs)?;

        if let Some(workspace) = workspace {
            let digests = output_fingerprints
                .iter()
                .map(|(property, fingerprint)| (property.clone(), fingerprint.digest().to_string()))
                .collect();
            let metadata = ImmutableWorkspaceMetadata::new(&executor.invocation_id, digests);
            if let Err(e) = workspace.write_metadata(&metadata) {
                warn!("failed to write workspace metadata for {}: {e}", self.work.id);
            }
        }

        let entry = HistoryEntry::new(
            self.work.id.clone(),
            &executor.invocation_id,
            &self.work.implementation,
            inputs.clone(),
            output_fingerprints,
            &decision.cache_key,
            duration_ms,
        );
        if let Err(e) = executor.history.store(&self.work.id, &entry) {
            warn!("failed to record execution history of {}: {e}", self.work.id);
        }
        Ok(())
    }

    fn store_in_cache(
        &self,
        anchor: &Utf8Path,
        outputs: &BTreeMap<String, Vec<Utf8PathBuf>>,
        key: &str,
        duration_ms: u64,
    ) {
        let roots = outputs.values().flatten().cloned().collect::<Vec<_>>();
        let stored = OutputBundle::collect(anchor, &roots, duration_ms)
            .and_then(|bundle| self.executor.cache.store(key, &bundle));
        match stored {
            Ok(()) => debug!("stored outputs of {} under {key}", self.work.id),
            Err(e) => warn!("not caching outputs of {}: {e}", self.work.id),
        }
    }
}

/// Properties whose outputs no longer match the workspace metadata.
fn tampered_properties(
    workspace: &Workspace,
    outputs: &BTreeMap<String, Fingerprint>,
) -> Option<Vec<String>> {
    let metadata = match workspace.metadata() {
        Ok(metadata) => metadata?,
        Err(e) => {
            warn!("ignoring unreadable workspace metadata: {e}");
            return None;
        }
    };
    let current = outputs
        .iter()
        .map(|(property, fingerprint)| (property.clone(), fingerprint.digest().to_string()))
        .collect();
    match metadata.verify(&current) {
        Verification::Matches => None,
        Verification::Modified(properties) => Some(properties),
    }
}

fn remove_outputs(outputs: &BTreeMap<String, Vec<Utf8PathBuf>>) -> Result<(), Error> {
    for path in outputs.values().flatten() {
        let removed = match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::Io {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
    Ok(())
}
