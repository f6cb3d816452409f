use itertools::Itertools;
use kiln_types::NodeId;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BuilderError {
    #[error("node {0} was added more than once")]
    #[diagnostic(code(kiln::duplicate_node))]
    DuplicateNode(NodeId),
    #[error("{referenced_by} references unknown node {node}")]
    #[diagnostic(
        code(kiln::unknown_node),
        help("add {node} to the graph or remove the edge")
    )]
    UnknownNode { node: NodeId, referenced_by: NodeId },
    #[error("cyclic dependency detected:\n{}", format_cycles(.cycles))]
    #[diagnostic(
        code(kiln::cyclic_dependency),
        help("dependencies, must-run-after and finalizer edges must not form a cycle")
    )]
    Cycle { cycles: Vec<Vec<NodeId>> },
    #[error("{0} depends on itself")]
    #[diagnostic(code(kiln::self_dependency))]
    SelfDependency(NodeId),
}

fn format_cycles(cycles: &[Vec<NodeId>]) -> String {
    cycles
        .iter()
        .map(|cycle| format!("\t{}", cycle.iter().format(", ")))
        .join("\n")
}

impl From<kiln_graph_utils::Error> for BuilderError {
    fn from(err: kiln_graph_utils::Error) -> Self {
        match err {
            kiln_graph_utils::Error::CyclicDependencies(cycles) => BuilderError::Cycle {
                cycles: cycles
                    .into_iter()
                    .map(|cycle| cycle.into_iter().map(NodeId::from).collect())
                    .collect(),
            },
            kiln_graph_utils::Error::SelfDependency(id) => BuilderError::SelfDependency(id.into()),
        }
    }
}
