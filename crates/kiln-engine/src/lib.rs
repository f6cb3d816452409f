//! kiln-engine: the work graph and its scheduler.
//!
//! A [`WorkGraph`] is assembled in the [`Building`] state, where nodes and
//! edges may be added in any order, and then [finalized](WorkGraph::finalize)
//! into the [`Built`] state. Finalizing resolves edges, rejects cycles through
//! hard edges and drops the soft edges that would otherwise close a cycle. A
//! built graph is immutable; [`FilteredView`]s select the part of it a run
//! should execute and the [`Scheduler`] walks a view.

mod builder_error;
mod dot;
mod execute;
mod view;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

pub use builder_error::BuilderError;
pub use execute::{ExecuteError, ExecutionOptions, ExecutionReport, NodeVisitor, Scheduler};
use itertools::Itertools;
use kiln_types::{NodeId, NodeKind, ResourceClaim};
use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction, Graph};
use tracing::debug;
pub use view::FilteredView;

/// Relationship declared between two nodes.
///
/// `add_edge(from, to, kind)` reads as "`from` <kind> `to`": `compile`
/// `Dependency` `resources` means compile depends on resources, `build`
/// `FinalizedBy` `cleanup` means cleanup finalizes build.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Dependency,
    MustRunAfter,
    ShouldRunAfter,
    FinalizedBy,
}

impl EdgeKind {
    /// Hard edges constrain ordering and can never be dropped.
    pub fn is_hard(&self) -> bool {
        !matches!(self, EdgeKind::ShouldRunAfter)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeKind::Dependency => "dependency",
            EdgeKind::MustRunAfter => "must run after",
            EdgeKind::ShouldRunAfter => "should run after",
            EdgeKind::FinalizedBy => "finalized by",
        })
    }
}

/// Edge stored in the graph. Every stored edge points from the node that
/// runs later to the node it waits for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Ordering {
    DependsOn,
    MustRunAfter,
    ShouldRunAfter,
    /// Source finalizes target.
    Finalizes,
}

impl Ordering {
    fn is_hard(&self) -> bool {
        !matches!(self, Ordering::ShouldRunAfter)
    }
}

/// The parts of a node definition the engine needs for scheduling.
pub trait NodeDefinitionInfo {
    fn kind(&self) -> NodeKind;
    fn resources(&self) -> &[ResourceClaim];
}

/// Minimal node definition, used when the caller has nothing richer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub resources: Vec<ResourceClaim>,
}

impl NodeDefinitionInfo for NodeInfo {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn resources(&self) -> &[ResourceClaim] {
        &self.resources
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

#[derive(Debug)]
pub struct WorkGraph<S = Built, T: NodeDefinitionInfo = NodeInfo> {
    marker: std::marker::PhantomData<S>,
    graph: Graph<NodeId, Ordering>,
    lookup: HashMap<NodeId, NodeIndex>,
    definitions: HashMap<NodeId, T>,
    /// Dependencies in the order they were declared.
    dependency_order: HashMap<NodeId, Vec<NodeId>>,
    declared_edges: Vec<(NodeId, NodeId, EdgeKind)>,
    dropped_soft_edges: Vec<(NodeId, NodeId)>,
}

/// A graph still accepting nodes and edges.
pub type WorkGraphBuilder<T = NodeInfo> = WorkGraph<Building, T>;

impl<T: NodeDefinitionInfo> WorkGraph<Building, T> {
    pub fn new() -> Self {
        Self {
            marker: std::marker::PhantomData,
            graph: Graph::default(),
            lookup: HashMap::default(),
            definitions: HashMap::default(),
            dependency_order: HashMap::default(),
            declared_edges: Vec::new(),
            dropped_soft_edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, id: impl Into<NodeId>, definition: T) -> Result<(), BuilderError> {
        let id = id.into();
        if self.lookup.contains_key(&id) {
            return Err(BuilderError::DuplicateNode(id));
        }
        let index = self.graph.add_node(id.clone());
        self.lookup.insert(id.clone(), index);
        self.definitions.insert(id, definition);
        Ok(())
    }

    /// Declares a relationship. Either end may be added later; unknown ends
    /// are reported by [`finalize`](Self::finalize).
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>, kind: EdgeKind) {
        self.declared_edges.push((from.into(), to.into(), kind));
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lookup.contains_key(id)
    }

    /// Resolves edges and validates the graph, sealing it from mutation.
    pub fn finalize(self) -> Result<WorkGraph<Built, T>, BuilderError> {
        let WorkGraph {
            mut graph,
            lookup,
            definitions,
            mut dependency_order,
            declared_edges,
            ..
        } = self;

        let mut unknown = declared_edges
            .iter()
            .flat_map(|(from, to, _)| [(from, to), (to, from)])
            .filter(|(missing, _)| !lookup.contains_key(*missing))
            .map(|(missing, referenced_by)| (missing.clone(), referenced_by.clone()))
            .collect::<Vec<_>>();
        unknown.sort();
        if let Some((node, referenced_by)) = unknown.into_iter().next() {
            return Err(BuilderError::UnknownNode {
                node,
                referenced_by,
            });
        }

        let mut seen = HashSet::new();
        for (from, to, kind) in &declared_edges {
            if !seen.insert((from, to, *kind)) {
                continue;
            }
            let (from_index, to_index) = (lookup[from], lookup[to]);
            match kind {
                EdgeKind::Dependency => {
                    graph.add_edge(from_index, to_index, Ordering::DependsOn);
                    dependency_order
                        .entry(from.clone())
                        .or_default()
                        .push(to.clone());
                }
                EdgeKind::MustRunAfter => {
                    graph.add_edge(from_index, to_index, Ordering::MustRunAfter);
                }
                EdgeKind::ShouldRunAfter => {
                    graph.add_edge(from_index, to_index, Ordering::ShouldRunAfter);
                }
                EdgeKind::FinalizedBy => {
                    graph.add_edge(to_index, from_index, Ordering::Finalizes);
                }
            }
        }

        kiln_graph_utils::validate_graph(&graph, Ordering::is_hard)?;

        let dropped = kiln_graph_utils::break_soft_cycles(&mut graph, |edge| {
            matches!(edge, Ordering::ShouldRunAfter)
        })?;
        let dropped_soft_edges = dropped
            .into_iter()
            .map(|(from, to)| {
                let edge = (graph[from].clone(), graph[to].clone());
                debug!(
                    "dropping '{} should run after {}' as it would create a cycle",
                    edge.0, edge.1
                );
                edge
            })
            .collect();

        Ok(WorkGraph {
            marker: std::marker::PhantomData,
            graph,
            lookup,
            definitions,
            dependency_order,
            declared_edges,
            dropped_soft_edges,
        })
    }
}

impl<T: NodeDefinitionInfo> Default for WorkGraph<Building, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: NodeDefinitionInfo> WorkGraph<Built, T> {
    /// Every node id, sorted.
    pub fn node_ids(&self) -> Vec<&NodeId> {
        self.lookup.keys().sorted().collect()
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lookup.contains_key(id)
    }

    pub fn definition(&self, id: &NodeId) -> Option<&T> {
        self.definitions.get(id)
    }

    /// Direct dependencies in declaration order.
    pub fn dependencies(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.lookup.get(id)?;
        Some(
            self.dependency_order
                .get(id)
                .map(|deps| deps.iter().collect())
                .unwrap_or_default(),
        )
    }

    /// Nodes that directly depend on `id`, sorted.
    pub fn dependents(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.neighbors(id, Ordering::DependsOn, Direction::Incoming)
    }

    pub fn must_run_after(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.neighbors(id, Ordering::MustRunAfter, Direction::Outgoing)
    }

    /// Soft predecessors that survived cycle breaking.
    pub fn should_run_after(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.neighbors(id, Ordering::ShouldRunAfter, Direction::Outgoing)
    }

    /// Nodes that declared `id` as a soft predecessor.
    pub fn should_run_before(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.neighbors(id, Ordering::ShouldRunAfter, Direction::Incoming)
    }

    /// Nodes that finalize `id`.
    pub fn finalizers(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.neighbors(id, Ordering::Finalizes, Direction::Incoming)
    }

    /// Nodes that `id` finalizes.
    pub fn finalized_by(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.neighbors(id, Ordering::Finalizes, Direction::Outgoing)
    }

    pub fn transitive_dependencies(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.closure(id, Direction::Outgoing)
    }

    pub fn transitive_dependents(&self, id: &NodeId) -> Option<Vec<&NodeId>> {
        self.closure(id, Direction::Incoming)
    }

    /// Soft edges removed while finalizing, as `(declaring node, target)`.
    pub fn dropped_soft_edges(&self) -> &[(NodeId, NodeId)] {
        &self.dropped_soft_edges
    }

    /// A view over every node.
    pub fn full_view(&self) -> FilteredView<'_, T> {
        FilteredView::all(self)
    }

    /// The requested nodes plus everything they need, minus `excluded`.
    pub fn filter(&self, requested: &[NodeId], excluded: &[NodeId]) -> FilteredView<'_, T> {
        FilteredView::new(self, requested, excluded)
    }

    fn neighbors(
        &self,
        id: &NodeId,
        ordering: Ordering,
        direction: Direction,
    ) -> Option<Vec<&NodeId>> {
        let index = *self.lookup.get(id)?;
        Some(
            self.graph
                .edges_directed(index, direction)
                .filter(|edge| *edge.weight() == ordering)
                .map(|edge| match direction {
                    Direction::Outgoing => &self.graph[edge.target()],
                    Direction::Incoming => &self.graph[edge.source()],
                })
                .sorted()
                .dedup()
                .collect(),
        )
    }

    fn closure(&self, id: &NodeId, direction: Direction) -> Option<Vec<&NodeId>> {
        let index = *self.lookup.get(id)?;
        let reachable = kiln_graph_utils::transitive_closure_by(
            &self.graph,
            [index],
            direction,
            |edge| *edge == Ordering::DependsOn,
        );
        Some(
            reachable
                .into_iter()
                .filter(|other| *other != index)
                .map(|other| &self.graph[other])
                .sorted()
                .collect(),
        )
    }

    pub(crate) fn index_of(&self, id: &NodeId) -> Option<NodeIndex> {
        self.lookup.get(id).copied()
    }

    pub(crate) fn edges_from(
        &self,
        index: NodeIndex,
        direction: Direction,
    ) -> impl Iterator<Item = (NodeIndex, EdgeKind)> + '_ {
        self.graph.edges_directed(index, direction).map(move |edge| {
            let other = match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            };
            let kind = match edge.weight() {
                Ordering::DependsOn => EdgeKind::Dependency,
                Ordering::MustRunAfter => EdgeKind::MustRunAfter,
                Ordering::ShouldRunAfter => EdgeKind::ShouldRunAfter,
                Ordering::Finalizes => EdgeKind::FinalizedBy,
            };
            (other, kind)
        })
    }

    pub(crate) fn id_at(&self, index: NodeIndex) -> &NodeId {
        &self.graph[index]
    }
}
