//! The finished dependency graph and the callback that assembles it.
mod assembler;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::Serialize;

use crate::function::ParameterizedFunction;
use crate::value::{TargetSpecification, ValueRequirement, ValueSpecification};

pub(crate) use assembler::GetTerminalValuesCallback;

/// One function application in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    pub function: ParameterizedFunction,
    pub target: TargetSpecification,
    pub inputs: BTreeSet<ValueSpecification>,
    pub outputs: BTreeSet<ValueSpecification>,
}

/// Function applications linked by the values they exchange.
///
/// Edges run from the producing node to the consuming node and carry the
/// consumed specification.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: Graph<DependencyNode, ValueSpecification>,
    terminal_outputs: BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>>,
    calculation_configuration: String,
}

impl DependencyGraph {
    pub(crate) fn new(
        graph: Graph<DependencyNode, ValueSpecification>,
        terminal_outputs: BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>>,
        calculation_configuration: String,
    ) -> Self {
        Self {
            graph,
            terminal_outputs,
            calculation_configuration,
        }
    }

    pub fn calculation_configuration(&self) -> &str {
        &self.calculation_configuration
    }

    pub fn graph(&self) -> &Graph<DependencyNode, ValueSpecification> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.graph.node_weights()
    }

    /// The node producing `spec`, if any.
    pub fn producer_of(&self, spec: &ValueSpecification) -> Option<&DependencyNode> {
        self.graph.node_weights().find(|node| node.outputs.contains(spec))
    }

    /// Terminal specifications and the requirements each one satisfies.
    pub fn terminal_outputs(&self) -> &BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>> {
        &self.terminal_outputs
    }

    /// Nodes nothing else consumes from.
    pub fn root_nodes(&self) -> Vec<&DependencyNode> {
        self.nodes_without(Direction::Outgoing)
    }

    /// Nodes that consume nothing from the graph.
    pub fn leaf_nodes(&self) -> Vec<&DependencyNode> {
        self.nodes_without(Direction::Incoming)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<&DependencyNode> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, direction)
                    .next()
                    .is_none()
            })
            .map(|index| &self.graph[index])
            .collect()
    }

    /// Nodes whose outputs `node` consumes.
    pub fn inputs_of(&self, index: NodeIndex) -> Vec<&DependencyNode> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|input| &self.graph[input])
            .collect()
    }

    pub fn is_acyclic(&self) -> bool {
        !petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Drops outputs that are neither consumed nor terminal, then nodes left
    /// without outputs, until nothing changes.
    pub fn remove_unnecessary_values(&mut self) {
        loop {
            let mut changed = false;
            for index in self.graph.node_indices() {
                let consumed: BTreeSet<ValueSpecification> = self
                    .graph
                    .edges_directed(index, Direction::Outgoing)
                    .map(|edge| edge.weight().clone())
                    .collect();
                let terminal = &self.terminal_outputs;
                let node = &mut self.graph[index];
                let before = node.outputs.len();
                node.outputs
                    .retain(|output| consumed.contains(output) || terminal.contains_key(output));
                changed |= node.outputs.len() != before;
            }

            let before = self.graph.node_count();
            self.graph
                .retain_nodes(|graph, index| !graph[index].outputs.is_empty());
            if !changed && self.graph.node_count() == before {
                return;
            }
        }
    }

    /// The graph as JSON, for debugging.
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Dump<'a> {
            calculation_configuration: &'a str,
            nodes: Vec<&'a DependencyNode>,
            edges: Vec<(usize, usize, &'a ValueSpecification)>,
            terminal_outputs: Vec<(&'a ValueSpecification, &'a BTreeSet<ValueRequirement>)>,
        }

        let dump = Dump {
            calculation_configuration: &self.calculation_configuration,
            nodes: self.graph.node_weights().collect(),
            edges: self
                .graph
                .edge_references()
                .map(|edge| (edge.source().index(), edge.target().index(), edge.weight()))
                .collect(),
            terminal_outputs: self.terminal_outputs.iter().collect(),
        };
        serde_json::to_string_pretty(&dump)
    }
}

/// Mermaid flowchart of the graph.
impl Display for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;
        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let outputs: Vec<&str> = node.outputs.iter().map(|output| output.name()).collect();
            writeln!(
                f,
                "    n{}[\"{} on {}<br/>{}\"]",
                index.index(),
                node.function,
                node.target,
                outputs.join(", ")
            )?;
        }
        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    n{} -->|{}| n{}",
                edge.source().index(),
                edge.weight().name(),
                edge.target().index()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::function::MarketDataSourcingFunction;
    use crate::value::ValueProperties;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, TargetSpecification::primitive("T"), ValueProperties::none())
    }

    fn node(inputs: &[&str], outputs: &[&str]) -> DependencyNode {
        DependencyNode {
            function: ParameterizedFunction::of(Arc::new(MarketDataSourcingFunction)),
            target: TargetSpecification::primitive("T"),
            inputs: inputs.iter().map(|name| spec(name)).collect(),
            outputs: outputs.iter().map(|name| spec(name)).collect(),
        }
    }

    /// leaf (X, Y) -> middle (A, B) -> top (C), with C terminal.
    fn chain() -> DependencyGraph {
        let mut graph = Graph::new();
        let leaf = graph.add_node(node(&[], &["X", "Y"]));
        let middle = graph.add_node(node(&["X"], &["A", "B"]));
        let top = graph.add_node(node(&["A"], &["C"]));
        graph.add_edge(leaf, middle, spec("X"));
        graph.add_edge(middle, top, spec("A"));
        let terminal = BTreeMap::from([(
            spec("C"),
            BTreeSet::from([ValueRequirement::of("C", TargetSpecification::primitive("T"))]),
        )]);
        DependencyGraph::new(graph, terminal, "Default".into())
    }

    #[test]
    fn test_roots_and_leaves() {
        let graph = chain();
        assert_eq!(graph.root_nodes(), [&node(&["A"], &["C"])]);
        assert_eq!(graph.leaf_nodes(), [&node(&[], &["X", "Y"])]);
        assert!(graph.is_acyclic());
        assert_eq!(graph.inputs_of(NodeIndex::new(2)), [&node(&["X"], &["A", "B"])]);
    }

    #[test]
    fn test_remove_unnecessary_values() {
        let mut graph = chain();
        graph.remove_unnecessary_values();
        assert_eq!(graph.node_count(), 3);
        let outputs: Vec<BTreeSet<ValueSpecification>> = graph.nodes().map(|node| node.outputs.clone()).collect();
        assert_eq!(
            outputs,
            [
                BTreeSet::from([spec("X")]),
                BTreeSet::from([spec("A")]),
                BTreeSet::from([spec("C")]),
            ]
        );
    }

    #[test]
    fn test_unconsumed_nodes_dropped() {
        let mut graph = chain();
        graph.graph.add_node(node(&[], &["Z"]));
        graph.remove_unnecessary_values();
        assert_eq!(graph.node_count(), 3);
        assert!(graph.producer_of(&spec("Z")).is_none());
    }

    #[test]
    fn test_mermaid_and_json() {
        let graph = chain();
        let mermaid = graph.to_string();
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("n0 -->|X| n1"));
        assert!(mermaid.contains("n1 -->|A| n2"));

        let json: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        assert_eq!(json["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(json["edges"].as_array().unwrap().len(), 2);
        assert_eq!(json["calculation_configuration"], "Default");
    }
}
