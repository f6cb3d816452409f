use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use itertools::Itertools;
use kiln_types::{
    CompletionListener, ContinueMode, NodeCompletion, NodeId, NodeResult, NodeState,
    ResourceAccess, ResourceClaim, SkipReason,
};
use petgraph::{graph::NodeIndex, Direction};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{EdgeKind, FilteredView, NodeDefinitionInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub concurrency: usize,
    pub continue_mode: ContinueMode,
    /// Maximum number of concurrent shared holders per resource name.
    /// Resources without an entry are unbounded for shared access.
    pub resource_capacities: HashMap<String, usize>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            continue_mode: ContinueMode::default(),
            resource_capacities: HashMap::new(),
        }
    }
}

impl ExecutionOptions {
    pub fn new(concurrency: usize, continue_mode: ContinueMode) -> Self {
        Self {
            concurrency,
            continue_mode,
            resource_capacities: HashMap::new(),
        }
    }

    pub fn with_resource_capacity(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.resource_capacities.insert(name.into(), capacity);
        self
    }
}

/// Does the actual work for a node.
///
/// The visitor is expected to handle its own errors: anything that goes
/// wrong is reported as a failed [`NodeResult`]. A visitor that panics is
/// treated as having failed.
#[async_trait]
pub trait NodeVisitor: Send + Sync + 'static {
    async fn visit(&self, id: NodeId, cancel: CancellationToken) -> NodeResult;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all nodes finished")]
    Semaphore,
    #[error("Worker pool closed channel before execution finished")]
    Visitor,
    #[error("execution stalled: no runnable node among {}", .0.iter().format(", "))]
    Stalled(Vec<NodeId>),
}

/// One terminal [`NodeCompletion`] per node of the executed view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    completions: BTreeMap<NodeId, NodeCompletion>,
}

impl ExecutionReport {
    pub fn get(&self, id: &str) -> Option<&NodeCompletion> {
        self.completions.get(id)
    }

    /// Completions sorted by node id.
    pub fn completions(&self) -> impl Iterator<Item = &NodeCompletion> {
        self.completions.values()
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeCompletion> {
        self.completions()
            .filter(|completion| completion.state == NodeState::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &NodeCompletion> {
        self.completions()
            .filter(|completion| completion.state == NodeState::Skipped)
    }

    /// True when every node executed successfully.
    pub fn is_success(&self) -> bool {
        self.completions().all(NodeCompletion::is_success)
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    pub fn into_completions(self) -> Vec<NodeCompletion> {
        self.completions.into_values().collect()
    }
}

/// Walks a [`FilteredView`], handing nodes to a [`NodeVisitor`] as soon as
/// they become eligible.
pub struct Scheduler {
    options: ExecutionOptions,
    listeners: Vec<Arc<dyn CompletionListener>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            options,
            listeners: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Executes every node of `view`.
    ///
    /// The calling task coordinates: it alone decides what runs next, while a
    /// fixed pool of workers calls the visitor. Node failures are part of the
    /// report; an `Err` means the scheduler itself broke down.
    pub async fn execute<T: NodeDefinitionInfo, V: NodeVisitor>(
        &self,
        view: &FilteredView<'_, T>,
        visitor: Arc<V>,
    ) -> Result<ExecutionReport, ExecuteError> {
        let concurrency = self.options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (work_tx, work_rx) = mpsc::channel::<Dispatch>(concurrency);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = (0..concurrency)
            .map(|_| {
                tokio::spawn(worker(
                    work_rx.clone(),
                    event_tx.clone(),
                    visitor.clone(),
                    self.cancel.clone(),
                ))
            })
            .collect::<FuturesUnordered<_>>();
        drop(event_tx);

        let mut coordinator = Coordinator::new(view, &self.options, &self.listeners);
        let result = coordinator
            .run(semaphore, work_tx, event_rx, &self.cancel)
            .await;

        // Closing the work channel lets idle workers exit.
        while let Some(joined) = workers.next().await {
            if let Err(e) = joined {
                debug!("scheduler worker exited abnormally: {e}");
            }
        }

        result?;
        Ok(coordinator.into_report())
    }
}

struct Dispatch {
    index: NodeIndex,
    id: NodeId,
    permit: OwnedSemaphorePermit,
}

enum Event {
    Started(NodeIndex),
    Finished {
        index: NodeIndex,
        result: NodeResult,
        duration: Duration,
    },
    /// The run was cancelled before the worker got to the node.
    Abandoned(NodeIndex),
}

async fn worker<V: NodeVisitor>(
    queue: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    events: mpsc::UnboundedSender<Event>,
    visitor: Arc<V>,
    cancel: CancellationToken,
) {
    loop {
        let Some(Dispatch { index, id, permit }) = queue.lock().await.recv().await else {
            break;
        };
        if cancel.is_cancelled() {
            drop(permit);
            if events.send(Event::Abandoned(index)).is_err() {
                break;
            }
            continue;
        }
        if events.send(Event::Started(index)).is_err() {
            break;
        }

        let start = Instant::now();
        let visit = tokio::spawn({
            let visitor = visitor.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            async move { visitor.visit(id, cancel).await }
        });
        let result = match visit.await {
            Ok(result) => result,
            Err(e) => NodeResult::failed(format!("{id} did not complete: {e}")),
        };
        drop(permit);

        let finished = Event::Finished {
            index,
            result,
            duration: start.elapsed(),
        };
        if events.send(finished).is_err() {
            trace!("coordinator stopped listening before {id} finished");
            break;
        }
    }
}

/// Static facts about one node, restricted to the view.
struct Plan {
    id: NodeId,
    /// Declaration order.
    dependencies: Vec<NodeIndex>,
    must_run_after: Vec<NodeIndex>,
    finalizes: Vec<NodeIndex>,
    soft_predecessors: Vec<NodeIndex>,
    soft_successors: Vec<NodeIndex>,
    resources: Vec<ResourceClaim>,
    requested: bool,
}

#[derive(Default)]
struct ResourceUse {
    exclusive: bool,
    shared: usize,
}

struct Coordinator<'a> {
    options: &'a ExecutionOptions,
    listeners: &'a [Arc<dyn CompletionListener>],
    /// Sorted by node id so every pass is deterministic.
    order: Vec<NodeIndex>,
    plans: HashMap<NodeIndex, Plan>,
    states: HashMap<NodeIndex, NodeState>,
    completions: BTreeMap<NodeId, NodeCompletion>,
    resources: HashMap<String, ResourceUse>,
    in_flight: usize,
    stopped_by: Option<NodeId>,
}

impl<'a> Coordinator<'a> {
    fn new<T: NodeDefinitionInfo>(
        view: &FilteredView<'_, T>,
        options: &'a ExecutionOptions,
        listeners: &'a [Arc<dyn CompletionListener>],
    ) -> Self {
        let graph = view.graph();
        let mut plans = HashMap::new();
        for id in view.node_ids() {
            let Some(index) = graph.index_of(id) else {
                continue;
            };
            let in_view = |kind: EdgeKind, direction: Direction| {
                graph
                    .edges_from(index, direction)
                    .filter(|(other, edge)| *edge == kind && view.contains_index(*other))
                    .map(|(other, _)| other)
                    .sorted_by_key(|other| graph.id_at(*other))
                    .dedup()
                    .collect::<Vec<_>>()
            };
            let dependencies = graph
                .dependencies(id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|dependency| graph.index_of(dependency))
                .filter(|dependency| view.contains_index(*dependency))
                .collect();
            let resources = graph
                .definition(id)
                .map(|definition| definition.resources().to_vec())
                .unwrap_or_default();
            plans.insert(
                index,
                Plan {
                    id: id.clone(),
                    dependencies,
                    must_run_after: in_view(EdgeKind::MustRunAfter, Direction::Outgoing),
                    finalizes: in_view(EdgeKind::FinalizedBy, Direction::Outgoing),
                    soft_predecessors: in_view(EdgeKind::ShouldRunAfter, Direction::Outgoing),
                    soft_successors: in_view(EdgeKind::ShouldRunAfter, Direction::Incoming),
                    resources,
                    requested: view.is_requested_index(index),
                },
            );
        }
        let order = plans
            .iter()
            .sorted_by(|(_, a), (_, b)| a.id.cmp(&b.id))
            .map(|(index, _)| *index)
            .collect();
        let states = plans.keys().map(|index| (*index, NodeState::Pending)).collect();

        Self {
            options,
            listeners,
            order,
            plans,
            states,
            completions: BTreeMap::new(),
            resources: HashMap::new(),
            in_flight: 0,
            stopped_by: None,
        }
    }

    async fn run(
        &mut self,
        semaphore: Arc<Semaphore>,
        work: mpsc::Sender<Dispatch>,
        mut events: mpsc::UnboundedReceiver<Event>,
        cancel: &CancellationToken,
    ) -> Result<(), ExecuteError> {
        loop {
            self.settle();
            let halted = cancel.is_cancelled() || self.stopped_by.is_some();
            if !halted {
                self.dispatch(&semaphore, &work).await?;
            }

            if self.in_flight == 0 {
                let remaining = self.pending();
                if remaining.is_empty() {
                    return Ok(());
                }
                if cancel.is_cancelled() {
                    self.skip_all(remaining, || SkipReason::Cancelled);
                    return Ok(());
                }
                if let Some(failed) = self.stopped_by.clone() {
                    self.skip_all(remaining, || SkipReason::BuildStopped {
                        failed: failed.clone(),
                    });
                    return Ok(());
                }
                let stalled = remaining
                    .into_iter()
                    .map(|index| self.plans[&index].id.clone())
                    .collect();
                return Err(ExecuteError::Stalled(stalled));
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => return Err(ExecuteError::Visitor),
                },
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    debug!("execution cancelled, no further nodes will start");
                }
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Started(index) => {
                self.states.insert(index, NodeState::Executing);
                let id = &self.plans[&index].id;
                trace!("{id} started");
                for listener in self.listeners {
                    listener.node_started(id);
                }
            }
            Event::Finished {
                index,
                result,
                duration,
            } => {
                self.in_flight -= 1;
                self.release(index);
                let id = self.plans[&index].id.clone();
                let completion = NodeCompletion::visited(id.clone(), result, duration);
                if completion.state == NodeState::Failed
                    && self.options.continue_mode == ContinueMode::Never
                    && self.stopped_by.is_none()
                {
                    debug!("{id} failed, stopping the build");
                    self.stopped_by = Some(id);
                }
                self.complete(index, completion);
            }
            Event::Abandoned(index) => {
                self.in_flight -= 1;
                self.release(index);
                let id = self.plans[&index].id.clone();
                self.complete(index, NodeCompletion::skipped(id, SkipReason::Cancelled));
            }
        }
    }

    /// Skips every pending node that can no longer run, until nothing changes.
    fn settle(&mut self) {
        loop {
            let skips = self
                .order
                .iter()
                .filter(|index| self.states[*index] == NodeState::Pending)
                .filter_map(|index| self.skip_reason(*index).map(|reason| (*index, reason)))
                .collect::<Vec<_>>();
            if skips.is_empty() {
                return;
            }
            for (index, reason) in skips {
                let id = self.plans[&index].id.clone();
                debug!("skipping {id}: {reason}");
                self.complete(index, NodeCompletion::skipped(id, reason));
            }
        }
    }

    fn skip_reason(&self, index: NodeIndex) -> Option<SkipReason> {
        let plan = &self.plans[&index];
        if let Some(dependency) = plan.dependencies.iter().find(|dependency| {
            self.states[*dependency].is_terminal() && !self.satisfies_dependents(**dependency)
        }) {
            return Some(SkipReason::DependencyFailed {
                dependency: self.plans[dependency].id.clone(),
            });
        }
        let finalized_all_done = plan
            .finalizes
            .iter()
            .all(|finalized| self.states[finalized].is_terminal());
        if !plan.finalizes.is_empty() && finalized_all_done && !plan.requested {
            let any_ran = plan.finalizes.iter().any(|finalized| {
                matches!(
                    self.states[finalized],
                    NodeState::Executed | NodeState::Failed
                )
            });
            if !any_ran {
                return Some(SkipReason::NothingToFinalize);
            }
        }
        None
    }

    fn is_eligible(&self, index: NodeIndex) -> bool {
        let plan = &self.plans[&index];
        let terminal = |other: &NodeIndex| self.states[other].is_terminal();
        plan.dependencies
            .iter()
            .all(|dependency| self.satisfies_dependents(*dependency))
            && plan.must_run_after.iter().all(terminal)
            && plan.finalizes.iter().all(terminal)
            && self.resources_available(&plan.resources)
    }

    /// Executed nodes satisfy their dependents, and so do nodes skipped for
    /// a reason that does not stem from a failure.
    fn satisfies_dependents(&self, index: NodeIndex) -> bool {
        match self.states[&index] {
            NodeState::Executed => true,
            NodeState::Skipped => self
                .completions
                .get(&self.plans[&index].id)
                .and_then(|completion| completion.skipped_because.as_ref())
                .is_some_and(|reason| !reason.blocks_dependents()),
            _ => false,
        }
    }

    /// Eligible nodes, best candidates first.
    fn eligible(&self) -> Vec<NodeIndex> {
        let not_started = |other: &NodeIndex| self.states[other] == NodeState::Pending;
        self.order
            .iter()
            .copied()
            .filter(|index| self.states[index] == NodeState::Pending && self.is_eligible(*index))
            .sorted_by_key(|index| {
                let plan = &self.plans[index];
                let waits_on_soft = plan.soft_predecessors.iter().any(not_started);
                let soft_blocks_others = plan.soft_successors.iter().any(not_started);
                (waits_on_soft, !soft_blocks_others, plan.id.clone())
            })
            .collect()
    }

    async fn dispatch(
        &mut self,
        semaphore: &Arc<Semaphore>,
        work: &mpsc::Sender<Dispatch>,
    ) -> Result<(), ExecuteError> {
        for index in self.eligible() {
            // An earlier dispatch in this pass may have taken the resources.
            if !self.resources_available(&self.plans[&index].resources) {
                continue;
            }
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => break,
                Err(TryAcquireError::Closed) => return Err(ExecuteError::Semaphore),
            };
            self.acquire(index);
            self.states.insert(index, NodeState::Queued);
            self.in_flight += 1;
            let id = self.plans[&index].id.clone();
            trace!("dispatching {id}");
            work.send(Dispatch { index, id, permit })
                .await
                .map_err(|_| ExecuteError::Visitor)?;
        }
        Ok(())
    }

    fn resources_available(&self, claims: &[ResourceClaim]) -> bool {
        claims.iter().all(|claim| {
            let held = self.resources.get(&claim.name);
            match claim.access {
                ResourceAccess::Exclusive => {
                    held.map_or(true, |held| !held.exclusive && held.shared == 0)
                }
                ResourceAccess::Shared => {
                    let capacity = self
                        .options
                        .resource_capacities
                        .get(&claim.name)
                        .copied()
                        .unwrap_or(usize::MAX);
                    let shared = held.map_or(0, |held| held.shared);
                    !held.map_or(false, |held| held.exclusive) && shared < capacity
                }
            }
        })
    }

    fn acquire(&mut self, index: NodeIndex) {
        for claim in &self.plans[&index].resources {
            let held = self.resources.entry(claim.name.clone()).or_default();
            match claim.access {
                ResourceAccess::Exclusive => held.exclusive = true,
                ResourceAccess::Shared => held.shared += 1,
            }
        }
    }

    fn release(&mut self, index: NodeIndex) {
        for claim in &self.plans[&index].resources {
            if let Some(held) = self.resources.get_mut(&claim.name) {
                match claim.access {
                    ResourceAccess::Exclusive => held.exclusive = false,
                    ResourceAccess::Shared => held.shared = held.shared.saturating_sub(1),
                }
            }
        }
    }

    fn pending(&self) -> Vec<NodeIndex> {
        self.order
            .iter()
            .copied()
            .filter(|index| !self.states[index].is_terminal())
            .collect()
    }

    fn skip_all(&mut self, indices: Vec<NodeIndex>, reason: impl Fn() -> SkipReason) {
        for index in indices {
            let id = self.plans[&index].id.clone();
            self.complete(index, NodeCompletion::skipped(id, reason()));
        }
    }

    fn complete(&mut self, index: NodeIndex, completion: NodeCompletion) {
        self.states.insert(index, completion.state);
        for listener in self.listeners {
            listener.node_completed(&completion);
        }
        self.completions.insert(completion.id.clone(), completion);
    }

    fn into_report(self) -> ExecutionReport {
        ExecutionReport {
            completions: self.completions,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use kiln_types::{NodeKind, WorkOutcome};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::{test::graph, Building, Built, EdgeKind, NodeInfo, WorkGraph};

    /// Records visit order, failing or panicking on request.
    #[derive(Default)]
    struct Recorder {
        visited: StdMutex<Vec<String>>,
        fail: Vec<&'static str>,
        panic: Vec<&'static str>,
        cancel_on: Option<&'static str>,
        delay: Option<Duration>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl Recorder {
        fn failing(fail: &[&'static str]) -> Self {
            Self {
                fail: fail.to_vec(),
                ..Default::default()
            }
        }

        fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeVisitor for Recorder {
        async fn visit(&self, id: NodeId, cancel: CancellationToken) -> NodeResult {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.visited.lock().unwrap().push(id.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.cancel_on == Some(id.as_str()) {
                cancel.cancel();
            }
            if self.panic.iter().any(|p| *p == id.as_str()) {
                panic!("visitor blew up");
            }
            if self.fail.iter().any(|f| *f == id.as_str()) {
                return NodeResult::failed(format!("{id} failed"));
            }
            NodeResult::success(WorkOutcome::Executed, vec![])
        }
    }

    #[derive(Default)]
    struct Listener {
        events: StdMutex<Vec<String>>,
    }

    impl CompletionListener for Listener {
        fn node_started(&self, id: &NodeId) {
            self.events.lock().unwrap().push(format!("start {id}"));
        }

        fn node_completed(&self, completion: &NodeCompletion) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {}", completion.state, completion.id));
        }
    }

    fn serial() -> Scheduler {
        Scheduler::new(ExecutionOptions::new(1, ContinueMode::Always))
    }

    fn state(report: &ExecutionReport, id: &str) -> NodeState {
        report.get(id).unwrap().state
    }

    fn skipped_because(report: &ExecutionReport, id: &str) -> Option<SkipReason> {
        report.get(id).unwrap().skipped_because.clone()
    }

    fn build_stage() -> WorkGraph<Built> {
        graph(
            &["compile", "test", "packageJar"],
            &[
                ("test", "compile", EdgeKind::Dependency),
                ("packageJar", "compile", EdgeKind::Dependency),
                ("packageJar", "test", EdgeKind::MustRunAfter),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn runs_dependencies_first() -> anyhow::Result<()> {
        let graph = build_stage();
        let recorder = Arc::new(Recorder::default());
        let report = serial()
            .execute(&graph.full_view(), recorder.clone())
            .await?;

        assert_eq!(recorder.visited(), vec!["compile", "test", "packageJar"]);
        assert!(report.is_success());
        assert_eq!(report.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn failure_skips_dependents_only() -> anyhow::Result<()> {
        let graph = graph(
            &["a", "b", "c", "d", "e"],
            &[
                ("b", "a", EdgeKind::Dependency),
                ("c", "b", EdgeKind::Dependency),
                ("e", "d", EdgeKind::Dependency),
            ],
        )?;
        let recorder = Arc::new(Recorder::failing(&["a"]));
        let report = serial()
            .execute(&graph.full_view(), recorder.clone())
            .await?;

        assert_eq!(state(&report, "a"), NodeState::Failed);
        assert_eq!(report.get("a").unwrap().failure.as_deref(), Some("a failed"));
        assert_eq!(
            skipped_because(&report, "b"),
            Some(SkipReason::DependencyFailed {
                dependency: NodeId::new("a")
            })
        );
        assert_eq!(
            skipped_because(&report, "c"),
            Some(SkipReason::DependencyFailed {
                dependency: NodeId::new("b")
            })
        );
        assert_eq!(state(&report, "d"), NodeState::Executed);
        assert_eq!(state(&report, "e"), NodeState::Executed);
        assert_eq!(recorder.visited(), vec!["a", "d", "e"]);
        Ok(())
    }

    #[tokio::test]
    async fn skip_names_the_failed_dependency() -> anyhow::Result<()> {
        let graph = graph(
            &["x", "y", "z"],
            &[
                ("z", "y", EdgeKind::Dependency),
                ("z", "x", EdgeKind::Dependency),
            ],
        )?;
        let report = serial()
            .execute(&graph.full_view(), Arc::new(Recorder::failing(&["y"])))
            .await?;
        assert_eq!(state(&report, "x"), NodeState::Executed);
        assert_eq!(
            skipped_because(&report, "z"),
            Some(SkipReason::DependencyFailed {
                dependency: NodeId::new("y")
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn fail_fast_stops_dispatch() -> anyhow::Result<()> {
        let graph = graph(
            &["a", "b", "c", "d"],
            &[("d", "a", EdgeKind::Dependency)],
        )?;
        let recorder = Arc::new(Recorder::failing(&["a"]));
        let report = Scheduler::new(ExecutionOptions::new(1, ContinueMode::Never))
            .execute(&graph.full_view(), recorder.clone())
            .await?;

        assert_eq!(recorder.visited(), vec!["a"]);
        let stopped = Some(SkipReason::BuildStopped {
            failed: NodeId::new("a"),
        });
        assert_eq!(skipped_because(&report, "b"), stopped);
        assert_eq!(skipped_because(&report, "c"), stopped);
        assert_eq!(
            skipped_because(&report, "d"),
            Some(SkipReason::DependencyFailed {
                dependency: NodeId::new("a")
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn panicking_visitor_fails_the_node() -> anyhow::Result<()> {
        let graph = graph(&["boom", "fine"], &[])?;
        let recorder = Arc::new(Recorder {
            panic: vec!["boom"],
            ..Default::default()
        });
        let report = serial().execute(&graph.full_view(), recorder).await?;
        assert_eq!(state(&report, "boom"), NodeState::Failed);
        assert_eq!(state(&report, "fine"), NodeState::Executed);
        Ok(())
    }

    #[test_case(4, 4 ; "unbounded")]
    #[test_case(2, 2 ; "bounded by concurrency")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_limit(concurrency: usize, expected: usize) -> anyhow::Result<()> {
        let graph = graph(&["a", "b", "c", "d"], &[])?;
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        Scheduler::new(ExecutionOptions::new(concurrency, ContinueMode::Always))
            .execute(&graph.full_view(), recorder.clone())
            .await?;
        assert!(recorder.max_running.load(Ordering::SeqCst) <= expected);
        assert_eq!(recorder.visited().len(), 4);
        Ok(())
    }

    fn with_resources(claims: &[(&str, ResourceClaim)]) -> anyhow::Result<WorkGraph<Built>> {
        let mut builder = WorkGraph::<Building>::new();
        for (id, claim) in claims {
            builder.add_node(
                *id,
                NodeInfo {
                    kind: NodeKind::Task,
                    resources: vec![claim.clone()],
                },
            )?;
        }
        Ok(builder.finalize()?)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exclusive_resources_never_overlap() -> anyhow::Result<()> {
        let graph = with_resources(&[
            ("a", ResourceClaim::exclusive("db")),
            ("b", ResourceClaim::exclusive("db")),
            ("c", ResourceClaim::shared("db")),
        ])?;
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let report = Scheduler::new(ExecutionOptions::new(4, ContinueMode::Always))
            .execute(&graph.full_view(), recorder.clone())
            .await?;
        assert!(report.is_success());
        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_resources_respect_capacity() -> anyhow::Result<()> {
        let graph = with_resources(&[
            ("a", ResourceClaim::shared("emulator")),
            ("b", ResourceClaim::shared("emulator")),
            ("c", ResourceClaim::shared("emulator")),
        ])?;
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let options =
            ExecutionOptions::new(4, ContinueMode::Always).with_resource_capacity("emulator", 2);
        Scheduler::new(options)
            .execute(&graph.full_view(), recorder.clone())
            .await?;
        assert!(recorder.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(recorder.visited().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn soft_predecessors_go_first() -> anyhow::Result<()> {
        // without the soft edge "a" would run first by id, and once "c" is
        // done nothing holds "a" back
        let graph = graph(
            &["a", "b", "c"],
            &[("a", "c", EdgeKind::ShouldRunAfter)],
        )?;
        let recorder = Arc::new(Recorder::default());
        serial()
            .execute(&graph.full_view(), recorder.clone())
            .await?;
        assert_eq!(recorder.visited(), vec!["c", "a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn soft_edge_does_not_wait_for_failure() -> anyhow::Result<()> {
        let graph = graph(&["a", "b"], &[("b", "a", EdgeKind::ShouldRunAfter)])?;
        let report = serial()
            .execute(&graph.full_view(), Arc::new(Recorder::failing(&["a"])))
            .await?;
        assert_eq!(state(&report, "b"), NodeState::Executed);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_abandons_pending_nodes() -> anyhow::Result<()> {
        let graph = graph(&["a", "b", "c"], &[])?;
        let recorder = Arc::new(Recorder {
            cancel_on: Some("a"),
            ..Default::default()
        });
        let scheduler = serial();
        let report = scheduler
            .execute(&graph.full_view(), recorder.clone())
            .await?;

        assert!(scheduler.cancellation_token().is_cancelled());
        assert_eq!(recorder.visited(), vec!["a"]);
        assert_eq!(state(&report, "a"), NodeState::Executed);
        assert_eq!(skipped_because(&report, "b"), Some(SkipReason::Cancelled));
        assert_eq!(skipped_because(&report, "c"), Some(SkipReason::Cancelled));
        Ok(())
    }

    #[tokio::test]
    async fn finalizer_runs_after_failure() -> anyhow::Result<()> {
        let graph = graph(
            &["build", "cleanup"],
            &[("build", "cleanup", EdgeKind::FinalizedBy)],
        )?;
        let recorder = Arc::new(Recorder::failing(&["build"]));
        let report = serial()
            .execute(&graph.full_view(), recorder.clone())
            .await?;
        assert_eq!(recorder.visited(), vec!["build", "cleanup"]);
        assert_eq!(state(&report, "cleanup"), NodeState::Executed);
        Ok(())
    }

    #[tokio::test]
    async fn finalizer_skipped_when_nothing_ran() -> anyhow::Result<()> {
        let graph = graph(
            &["setup", "build", "cleanup"],
            &[
                ("build", "setup", EdgeKind::Dependency),
                ("build", "cleanup", EdgeKind::FinalizedBy),
            ],
        )?;
        let report = serial()
            .execute(&graph.full_view(), Arc::new(Recorder::failing(&["setup"])))
            .await?;
        assert_eq!(
            skipped_because(&report, "cleanup"),
            Some(SkipReason::NothingToFinalize)
        );
        Ok(())
    }

    #[tokio::test]
    async fn skipped_finalizer_does_not_block_dependents() -> anyhow::Result<()> {
        let graph = graph(
            &["setup", "build", "cleanup", "deploy"],
            &[
                ("build", "setup", EdgeKind::Dependency),
                ("build", "cleanup", EdgeKind::FinalizedBy),
                ("deploy", "cleanup", EdgeKind::Dependency),
            ],
        )?;
        let recorder = Arc::new(Recorder::failing(&["setup"]));
        let report = serial()
            .execute(&graph.full_view(), recorder.clone())
            .await?;
        assert_eq!(recorder.visited(), vec!["setup", "deploy"]);
        assert_eq!(
            skipped_because(&report, "build"),
            Some(SkipReason::DependencyFailed {
                dependency: NodeId::new("setup")
            })
        );
        assert_eq!(
            skipped_because(&report, "cleanup"),
            Some(SkipReason::NothingToFinalize)
        );
        assert_eq!(state(&report, "deploy"), NodeState::Executed);
        Ok(())
    }

    #[tokio::test]
    async fn requested_finalizer_runs_on_its_own() -> anyhow::Result<()> {
        let graph = graph(
            &["build", "cleanup"],
            &[("build", "cleanup", EdgeKind::FinalizedBy)],
        )?;
        let recorder = Arc::new(Recorder::default());
        let view = graph.filter(&[NodeId::new("cleanup")], &[]);
        let report = serial().execute(&view, recorder.clone()).await?;
        assert_eq!(recorder.visited(), vec!["cleanup"]);
        assert_eq!(report.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn listeners_see_every_node() -> anyhow::Result<()> {
        let graph = graph(&["a", "b"], &[("b", "a", EdgeKind::Dependency)])?;
        let listener = Arc::new(Listener::default());
        serial()
            .with_listener(listener.clone())
            .execute(&graph.full_view(), Arc::new(Recorder::failing(&["a"])))
            .await?;
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec!["start a", "failed a", "skipped b"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn excluded_dependency_is_not_waited_on() -> anyhow::Result<()> {
        let graph = build_stage();
        let recorder = Arc::new(Recorder::default());
        let view = graph.filter(&[NodeId::new("packageJar")], &[NodeId::new("compile")]);
        let report = serial().execute(&view, recorder.clone()).await?;
        assert_eq!(recorder.visited(), vec!["packageJar"]);
        assert!(report.get("compile").is_none());
        Ok(())
    }
}
