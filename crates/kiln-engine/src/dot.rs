use std::io;

use itertools::Itertools;
use kiln_types::NodeKind;
use petgraph::visit::EdgeRef;

use crate::{Built, NodeDefinitionInfo, Ordering, WorkGraph};

impl<T: NodeDefinitionInfo> WorkGraph<Built, T> {
    /// Renders the graph in Graphviz DOT format with nodes and edges sorted.
    ///
    /// Edges point from the node that runs later to the node it waits for.
    pub fn to_dot(&self) -> String {
        let nodes = self.node_ids().into_iter().map(|id| {
            let shape = match self.definitions.get(id).map(|def| def.kind()) {
                Some(NodeKind::Transform) => " [shape=box]",
                _ => "",
            };
            format!("\t\"{}\"{shape}", escape(id.as_str()))
        });
        let edges = self
            .graph
            .edge_references()
            .map(|edge| {
                let style = match edge.weight() {
                    Ordering::DependsOn => "",
                    Ordering::MustRunAfter => " [style=dashed]",
                    Ordering::ShouldRunAfter => " [style=dotted]",
                    Ordering::Finalizes => " [label=\"finalizes\"]",
                };
                (
                    &self.graph[edge.source()],
                    &self.graph[edge.target()],
                    style,
                )
            })
            .sorted()
            .map(|(from, to, style)| {
                format!(
                    "\t\"{}\" -> \"{}\"{style}",
                    escape(from.as_str()),
                    escape(to.as_str())
                )
            });
        format!("digraph {{\n{}\n}}\n", nodes.chain(edges).join("\n"))
    }

    pub fn dot_graph<W: io::Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.to_dot().as_bytes())
    }
}

fn escape(id: &str) -> String {
    id.replace('\\', "\\\\").replace('"', "\\\"")
}
