//! Dependency analysis and execution ordering.
//!
//! Nodes are linked through the data objects they share: a node that writes
//! an object (output or bidirectional slot) runs before every node that reads
//! it (input or bidirectional slot). Each object may have at most one writer
//! per graph.

use crate::core::error::{VxError, VxResult};
use crate::core::reference::{Node, Reference};
use crate::graph::node::NodeSnapshot;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Data-flow graph of a set of nodes.
pub(crate) struct TopologyAnalyzer {
    graph: DiGraph<Node, Reference>,
}

impl TopologyAnalyzer {
    /// Link every writer to the readers of what it writes.
    pub(crate) fn new(nodes: &[NodeSnapshot]) -> VxResult<Self> {
        let mut graph = DiGraph::with_capacity(nodes.len(), nodes.len());
        let indices: Vec<NodeIndex> = nodes.iter().map(|n| graph.add_node(n.node)).collect();

        let mut writers: HashMap<Reference, usize> = HashMap::new();
        for (position, snapshot) in nodes.iter().enumerate() {
            for (slot, argument) in snapshot.signature.iter().zip(&snapshot.arguments) {
                let Some(reference) = *argument else { continue };
                if !slot.direction.writes() {
                    continue;
                }
                if let Some(&other) = writers.get(&reference) {
                    if other != position {
                        return Err(VxError::InvalidParameters(format!(
                            "{} is written by both {} and {}",
                            reference, nodes[other].node, snapshot.node
                        )));
                    }
                }
                writers.insert(reference, position);
            }
        }

        for (position, snapshot) in nodes.iter().enumerate() {
            for (slot, argument) in snapshot.signature.iter().zip(&snapshot.arguments) {
                let Some(reference) = *argument else { continue };
                if !slot.direction.reads() {
                    continue;
                }
                if let Some(&writer) = writers.get(&reference) {
                    if writer != position {
                        graph.update_edge(indices[writer], indices[position], reference);
                    }
                }
            }
        }
        Ok(Self { graph })
    }

    /// Nodes ordered so that writers come before their readers.
    pub(crate) fn topological_sort(&self) -> VxResult<Vec<Node>> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|index| self.graph[index]).collect())
            .map_err(|cycle| {
                VxError::InvalidParameters(format!(
                    "data-flow cycle through {}",
                    self.graph[cycle.node_id()]
                ))
            })
    }

    /// Number of writer-to-reader links.
    pub(crate) fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::error::Status;
    use crate::core::reference::{Graph, Handle, Kernel};
    use crate::core::types::{DataType, Direction, ParameterState, ParameterType};
    use crate::kernels::kernel::{KernelFunction, KernelValidator, MetaFormat};
    use std::sync::Arc;

    fn unary(ctx: &Context, name: &str, output: Direction) -> Kernel {
        let function: KernelFunction = Arc::new(|_: &Context, _: Node, _: &[Option<Reference>]| Ok(()));
        let validator =
            KernelValidator::whole(|_: &Context, _: Node, _: &[Option<Reference>], _: &mut [MetaFormat]| Ok(()));
        let kernel = ctx.register_kernel(name, 1, function, 2, validator).unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, output, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        kernel
    }

    fn link(ctx: &Context, graph: Graph, kernel: Kernel, from: Reference, to: Reference) -> Node {
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(node, 0, Some(from)).unwrap();
        ctx.set_parameter_by_index(node, 1, Some(to)).unwrap();
        node
    }

    fn snapshots(ctx: &Context, graph: Graph) -> Vec<NodeSnapshot> {
        ctx.graph_nodes(graph)
            .unwrap()
            .into_iter()
            .map(|n| ctx.node_snapshot(n).unwrap())
            .collect()
    }

    #[test]
    fn test_chain_sorted_against_creation_order() {
        let ctx = Context::new();
        let kernel = unary(&ctx, "copy", Direction::Output);
        let graph = ctx.create_graph().unwrap();
        let arrays: Vec<Reference> = (0..4)
            .map(|_| ctx.create_array(DataType::UInt8, 2).unwrap().reference())
            .collect();
        // Created last-to-first.
        let c = link(&ctx, graph, kernel, arrays[2], arrays[3]);
        let b = link(&ctx, graph, kernel, arrays[1], arrays[2]);
        let a = link(&ctx, graph, kernel, arrays[0], arrays[1]);

        let analyzer = TopologyAnalyzer::new(&snapshots(&ctx, graph)).unwrap();
        assert_eq!(analyzer.edge_count(), 2);
        assert_eq!(analyzer.topological_sort().unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_cycle_and_double_writer_rejected() {
        let ctx = Context::new();
        let kernel = unary(&ctx, "copy", Direction::Output);
        let graph = ctx.create_graph().unwrap();
        let x = ctx.create_array(DataType::UInt8, 2).unwrap().reference();
        let y = ctx.create_array(DataType::UInt8, 2).unwrap().reference();
        link(&ctx, graph, kernel, x, y);
        link(&ctx, graph, kernel, y, x);
        let analyzer = TopologyAnalyzer::new(&snapshots(&ctx, graph)).unwrap();
        assert_eq!(analyzer.topological_sort().unwrap_err().status(), Status::InvalidParameters);

        let other = ctx.create_graph().unwrap();
        link(&ctx, other, kernel, x, y);
        link(&ctx, other, kernel, x, y);
        let err = TopologyAnalyzer::new(&snapshots(&ctx, other)).err().map(|e| e.status());
        assert_eq!(err, Some(Status::InvalidParameters));
    }

    #[test]
    fn test_bidirectional_slot_is_not_a_self_loop() {
        let ctx = Context::new();
        let kernel = unary(&ctx, "accumulate", Direction::Bidirectional);
        let graph = ctx.create_graph().unwrap();
        let x = ctx.create_array(DataType::UInt8, 2).unwrap().reference();
        let acc = ctx.create_array(DataType::UInt8, 2).unwrap().reference();
        link(&ctx, graph, kernel, x, acc);
        let analyzer = TopologyAnalyzer::new(&snapshots(&ctx, graph)).unwrap();
        assert_eq!(analyzer.edge_count(), 0);
        assert_eq!(analyzer.topological_sort().unwrap().len(), 1);
    }
}
