use std::collections::{HashSet, VecDeque};

use itertools::Itertools;
use kiln_types::NodeId;
use petgraph::{graph::NodeIndex, Direction};
use tracing::warn;

use crate::{Built, EdgeKind, NodeDefinitionInfo, WorkGraph};

/// The part of a [`WorkGraph`] selected for one execution.
///
/// Starting from the requested nodes, the view follows dependency edges and
/// pulls in the finalizers of every included node along with their
/// dependencies. Excluded nodes are neither included nor traversed.
pub struct FilteredView<'a, T: NodeDefinitionInfo> {
    graph: &'a WorkGraph<Built, T>,
    included: HashSet<NodeIndex>,
    requested: HashSet<NodeIndex>,
}

impl<'a, T: NodeDefinitionInfo> FilteredView<'a, T> {
    pub(crate) fn new(
        graph: &'a WorkGraph<Built, T>,
        requested: &[NodeId],
        excluded: &[NodeId],
    ) -> Self {
        let excluded: HashSet<NodeIndex> = excluded
            .iter()
            .filter_map(|id| graph.index_of(id))
            .collect();
        let requested: HashSet<NodeIndex> = requested
            .iter()
            .filter_map(|id| {
                let index = graph.index_of(id);
                if index.is_none() {
                    warn!("ignoring request for unknown node {id}");
                }
                index
            })
            .filter(|index| !excluded.contains(index))
            .collect();

        let mut included = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = requested.iter().copied().collect();
        while let Some(index) = queue.pop_front() {
            if !included.insert(index) {
                continue;
            }
            let dependencies = graph
                .edges_from(index, Direction::Outgoing)
                .filter(|(_, kind)| *kind == EdgeKind::Dependency);
            let finalizers = graph
                .edges_from(index, Direction::Incoming)
                .filter(|(_, kind)| *kind == EdgeKind::FinalizedBy);
            queue.extend(
                dependencies
                    .chain(finalizers)
                    .map(|(other, _)| other)
                    .filter(|other| !excluded.contains(other) && !included.contains(other)),
            );
        }

        Self {
            graph,
            included,
            requested,
        }
    }

    /// Every node of the graph. Nodes that only finalize others are not
    /// considered requested, so they run only when something they finalize
    /// runs.
    pub(crate) fn all(graph: &'a WorkGraph<Built, T>) -> Self {
        let included: HashSet<NodeIndex> = graph.lookup.values().copied().collect();
        let requested = included
            .iter()
            .copied()
            .filter(|index| {
                !graph
                    .edges_from(*index, Direction::Outgoing)
                    .any(|(_, kind)| kind == EdgeKind::FinalizedBy)
            })
            .collect();
        Self {
            graph,
            included,
            requested,
        }
    }

    pub fn graph(&self) -> &'a WorkGraph<Built, T> {
        self.graph
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.graph
            .index_of(id)
            .map_or(false, |index| self.included.contains(&index))
    }

    pub fn is_requested(&self, id: &NodeId) -> bool {
        self.graph
            .index_of(id)
            .map_or(false, |index| self.requested.contains(&index))
    }

    /// Included node ids, sorted.
    pub fn node_ids(&self) -> Vec<&'a NodeId> {
        self.included
            .iter()
            .map(|index| self.graph.id_at(*index))
            .sorted()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.included.len()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    pub(crate) fn contains_index(&self, index: NodeIndex) -> bool {
        self.included.contains(&index)
    }

    pub(crate) fn is_requested_index(&self, index: NodeIndex) -> bool {
        self.requested.contains(&index)
    }
}

#[cfg(test)]
mod test {
    use kiln_types::NodeId;
    use pretty_assertions::assert_eq;

    use crate::{test::graph, EdgeKind};

    fn ids(ids: Vec<&NodeId>) -> Vec<&str> {
        ids.into_iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn follows_dependencies_only() -> anyhow::Result<()> {
        let graph = graph(
            &["compile", "test", "jar", "lint", "docs"],
            &[
                ("test", "compile", EdgeKind::Dependency),
                ("jar", "compile", EdgeKind::Dependency),
                ("jar", "docs", EdgeKind::MustRunAfter),
                ("lint", "compile", EdgeKind::ShouldRunAfter),
            ],
        )?;
        let jar = NodeId::new("jar");
        let view = graph.filter(&[jar.clone()], &[]);
        assert_eq!(ids(view.node_ids()), vec!["compile", "jar"]);
        assert!(view.is_requested(&jar));
        assert!(!view.is_requested(&NodeId::new("compile")));
        Ok(())
    }

    #[test]
    fn pulls_in_finalizers_and_their_dependencies() -> anyhow::Result<()> {
        let graph = graph(
            &["build", "cleanup", "report", "other"],
            &[
                ("build", "cleanup", EdgeKind::FinalizedBy),
                ("cleanup", "report", EdgeKind::Dependency),
            ],
        )?;
        let view = graph.filter(&[NodeId::new("build")], &[]);
        assert_eq!(ids(view.node_ids()), vec!["build", "cleanup", "report"]);
        Ok(())
    }

    #[test]
    fn excluded_nodes_are_not_traversed() -> anyhow::Result<()> {
        let graph = graph(
            &["a", "b", "c"],
            &[
                ("a", "b", EdgeKind::Dependency),
                ("b", "c", EdgeKind::Dependency),
            ],
        )?;
        let b = NodeId::new("b");
        let view = graph.filter(&[NodeId::new("a")], &[b.clone()]);
        assert_eq!(ids(view.node_ids()), vec!["a"]);
        assert!(!view.contains(&b));
        Ok(())
    }

    #[test]
    fn full_view_does_not_request_finalizers() -> anyhow::Result<()> {
        let graph = graph(
            &["build", "cleanup"],
            &[("build", "cleanup", EdgeKind::FinalizedBy)],
        )?;
        let view = graph.full_view();
        assert_eq!(view.len(), 2);
        assert!(view.is_requested(&NodeId::new("build")));
        assert!(!view.is_requested(&NodeId::new("cleanup")));
        Ok(())
    }
}
