//! Graph structure and node management.
//!
//! A graph owns an ordered list of nodes (one internal reference each) and
//! the execution order computed by its last successful verification. Any
//! change to the node list or to a binding drops the graph back to
//! unverified.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::{Graph, Handle, NewReference, Node, Object, RefKind};
use indexmap::IndexSet;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

pub(crate) struct GraphObject {
    state: Mutex<GraphState>,
}

#[derive(Default)]
struct GraphState {
    nodes: IndexSet<Node>,
    verified: bool,
    order: Vec<Node>,
    runs: u32,
}

impl GraphObject {
    pub(crate) fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub(crate) fn add_node(&self, node: Node) {
        let mut state = self.state.lock();
        state.nodes.insert(node);
        state.verified = false;
    }

    /// Take `node` out of the list; false if it was not there.
    pub(crate) fn remove_node(&self, node: Node) -> bool {
        let mut state = self.state.lock();
        state.order.retain(|n| *n != node);
        state.nodes.shift_remove(&node)
    }

    pub(crate) fn nodes(&self) -> Vec<Node> {
        self.state.lock().nodes.iter().copied().collect()
    }

    /// Release the graph's hold on every node.
    pub(crate) fn destruct(&self, ctx: &Context) -> VxResult<()> {
        let nodes: Vec<Node> = {
            let mut state = self.state.lock();
            state.order.clear();
            state.nodes.drain(..).collect()
        };
        let mut first_error = None;
        for node in nodes {
            if let Err(e) = ctx.decrement(node.reference(), RefKind::Internal) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Public description of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphInfo {
    /// Number of nodes.
    pub node_count: usize,
    /// Whether the last verification succeeded and nothing changed since.
    pub verified: bool,
    /// Completed runs.
    pub runs: u32,
}

impl Context {
    /// Create an empty graph.
    pub fn create_graph(&self) -> VxResult<Graph> {
        let object = GraphObject {
            state: Mutex::new(GraphState::default()),
        };
        let reference = self.create_reference(NewReference::external(Object::Graph(object)))?;
        debug!("created graph {}", reference);
        Ok(Graph::wrap(reference))
    }

    /// Describe a graph.
    pub fn query_graph(&self, graph: Graph) -> VxResult<GraphInfo> {
        let entry = self.entry(graph.reference())?;
        let state = entry.graph()?.state.lock();
        Ok(GraphInfo {
            node_count: state.nodes.len(),
            verified: state.verified,
            runs: state.runs,
        })
    }

    /// Nodes of a graph in creation order.
    pub fn graph_nodes(&self, graph: Graph) -> VxResult<Vec<Node>> {
        Ok(self.entry(graph.reference())?.graph()?.nodes())
    }

    /// Nodes in the order the last verification chose.
    pub fn execution_order(&self, graph: Graph) -> VxResult<Vec<Node>> {
        let entry = self.entry(graph.reference())?;
        let state = entry.graph()?.state.lock();
        if !state.verified {
            return Err(VxError::NotSupported(format!("{} is not verified", graph)));
        }
        Ok(state.order.clone())
    }

    /// Whether `graph` is verified. A destroyed graph counts as unverified.
    pub fn is_graph_verified(&self, graph: Graph) -> bool {
        self.entry(graph.reference())
            .ok()
            .and_then(|entry| entry.graph().ok().map(|g| g.state.lock().verified))
            .unwrap_or(false)
    }

    /// Drop a graph back to unverified. A destroyed graph is left alone.
    pub(crate) fn mark_unverified(&self, graph: Graph) -> VxResult<()> {
        if let Ok(entry) = self.entry(graph.reference()) {
            let mut state = entry.graph()?.state.lock();
            state.verified = false;
            state.order.clear();
        }
        Ok(())
    }

    pub(crate) fn mark_verified(&self, graph: Graph, order: Vec<Node>) -> VxResult<()> {
        let entry = self.entry(graph.reference())?;
        let mut state = entry.graph()?.state.lock();
        state.verified = true;
        state.order = order;
        Ok(())
    }

    pub(crate) fn record_run(&self, graph: Graph) -> VxResult<()> {
        self.entry(graph.reference())?.graph()?.state.lock().runs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Status;
    use crate::core::reference::Reference;
    use crate::kernels::kernel::{KernelFunction, KernelValidator, MetaFormat};
    use std::sync::Arc;

    fn empty_kernel(ctx: &Context) -> crate::core::reference::Kernel {
        let function: KernelFunction = Arc::new(|_: &Context, _: Node, _: &[Option<Reference>]| Ok(()));
        let validator =
            KernelValidator::whole(|_: &Context, _: Node, _: &[Option<Reference>], _: &mut [MetaFormat]| Ok(()));
        let kernel = ctx.register_kernel("test.empty", 1, function, 0, validator).unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        kernel
    }

    #[test]
    fn test_graph_tracks_nodes() {
        let ctx = Context::new();
        let kernel = empty_kernel(&ctx);
        let graph = ctx.create_graph().unwrap();
        let a = ctx.create_generic_node(graph, kernel).unwrap();
        let b = ctx.create_generic_node(graph, kernel).unwrap();
        assert_eq!(ctx.graph_nodes(graph).unwrap(), vec![a, b]);
        assert_eq!(ctx.query_graph(graph).unwrap().node_count, 2);
        assert!(!ctx.is_graph_verified(graph));
        assert_eq!(ctx.execution_order(graph).unwrap_err().status(), Status::NotSupported);

        ctx.mark_verified(graph, vec![b, a]).unwrap();
        assert_eq!(ctx.execution_order(graph).unwrap(), vec![b, a]);

        ctx.remove_node(a).unwrap();
        assert!(!ctx.is_graph_verified(graph));
        assert_eq!(ctx.graph_nodes(graph).unwrap(), vec![b]);
    }

    #[test]
    fn test_release_graph_releases_nodes() {
        let ctx = Context::new();
        let kernel = empty_kernel(&ctx);
        let graph = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.release(node).unwrap();
        assert!(ctx.is_valid_reference(node));

        ctx.release(graph).unwrap();
        assert!(!ctx.is_valid_reference(node));
        assert!(!ctx.is_graph_verified(graph));
        assert_eq!(ctx.query_reference(kernel).unwrap().internal_count, 1);
        assert_eq!(ctx.reference_count(), 1);
    }
}
