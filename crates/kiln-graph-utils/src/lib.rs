use std::{
    collections::{HashSet, VecDeque},
    fmt::Display,
    hash::Hash,
};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, Reversed},
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("cyclic dependency detected:\n{}", format_cycles(.0))]
    CyclicDependencies(Vec<Vec<String>>),
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| format!("\t{}", cycle.iter().format(", ")))
        .join("\n")
}

pub fn transitive_closure<N: Hash + Eq + PartialEq, E, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, E>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Like [`transitive_closure`], only following edges accepted by `follow`.
///
/// The starting nodes are part of the result.
pub fn transitive_closure_by<N, E, I>(
    graph: &Graph<N, E>,
    indices: I,
    direction: petgraph::Direction,
    follow: impl Fn(&E) -> bool,
) -> HashSet<NodeIndex>
where
    I: IntoIterator<Item = NodeIndex>,
{
    let mut visited = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = indices.into_iter().collect();
    while let Some(index) = queue.pop_front() {
        if !visited.insert(index) {
            continue;
        }
        for edge in graph.edges_directed(index, direction) {
            if !follow(edge.weight()) {
                continue;
            }
            let next = match direction {
                petgraph::Direction::Outgoing => edge.target(),
                petgraph::Direction::Incoming => edge.source(),
            };
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    visited
}

/// Checks that the subgraph of edges accepted by `hard` is acyclic.
///
/// Every strongly connected component with more than one member is
/// reported, members sorted and components ordered by their first member so
/// the message does not depend on insertion order.
pub fn validate_graph<N: Display, E>(
    graph: &Graph<N, E>,
    hard: impl Fn(&E) -> bool,
) -> Result<(), Error> {
    // Keeping every node keeps every index stable.
    let hard_graph = graph.filter_map(|_, node| Some(node), |_, edge| hard(edge).then_some(()));

    let cycles: Vec<Vec<String>> = petgraph::algo::tarjan_scc(&hard_graph)
        .into_iter()
        .filter(|cycle| cycle.len() > 1)
        .map(|cycle| {
            cycle
                .into_iter()
                .map(|id| hard_graph[id].to_string())
                .sorted()
                .collect::<Vec<_>>()
        })
        .sorted()
        .collect();

    if !cycles.is_empty() {
        return Err(Error::CyclicDependencies(cycles));
    }

    for edge in hard_graph.edge_references() {
        if edge.source() == edge.target() {
            return Err(Error::SelfDependency(hard_graph[edge.source()].to_string()));
        }
    }

    Ok(())
}

/// Removes edges accepted by `soft` until the graph is acyclic.
///
/// Within each cycle the soft edge whose source sorts lowest goes first,
/// ties broken by the lowest target. Returns the removed edges in removal
/// order. Fails if a cycle contains no soft edge at all; callers are
/// expected to have run [`validate_graph`] on the hard edges first.
pub fn break_soft_cycles<N, E>(
    graph: &mut Graph<N, E>,
    soft: impl Fn(&E) -> bool,
) -> Result<Vec<(NodeIndex, NodeIndex)>, Error>
where
    N: Ord + Display,
{
    let mut removed = Vec::new();
    loop {
        let self_loop = graph
            .edge_references()
            .filter(|edge| edge.source() == edge.target() && soft(edge.weight()))
            .min_by(|a, b| graph[a.source()].cmp(&graph[b.source()]))
            .map(|edge| edge.id());
        if let Some(edge) = self_loop {
            if let Some((source, target)) = graph.edge_endpoints(edge) {
                removed.push((source, target));
            }
            graph.remove_edge(edge);
            continue;
        }

        // Edge indices shift on removal and a component may be broken by
        // an earlier removal, so only the first cycle is handled per pass.
        let Some(component) = petgraph::algo::tarjan_scc(&*graph)
            .into_iter()
            .find(|component| component.len() > 1)
        else {
            return Ok(removed);
        };

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let candidate = graph
            .edge_references()
            .filter(|edge| {
                soft(edge.weight())
                    && members.contains(&edge.source())
                    && members.contains(&edge.target())
            })
            .min_by(|a, b| {
                graph[a.source()]
                    .cmp(&graph[b.source()])
                    .then_with(|| graph[a.target()].cmp(&graph[b.target()]))
            })
            .map(|edge| (edge.id(), edge.source(), edge.target()));

        let Some((edge, source, target)) = candidate else {
            let names = component
                .iter()
                .map(|index| graph[*index].to_string())
                .sorted()
                .collect();
            return Err(Error::CyclicDependencies(vec![names]));
        };
        graph.remove_edge(edge);
        removed.push((source, target));
    }
}
