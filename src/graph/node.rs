//! Nodes: kernels instantiated inside a graph with bound arguments.
//!
//! A node holds an internal reference on its kernel and on every bound
//! argument. Its graph holds an internal reference on the node; the creator
//! holds an external one.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::{Graph, Handle, Kernel, NewReference, Node, Object, RefKind, Reference};
use crate::core::types::{BorderMode, ParameterState};
use crate::kernels::kernel::{KernelAttribute, KernelAttributes, KernelEntry, KernelValidator, ParameterInfo};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

pub(crate) struct NodeObject {
    kernel: Kernel,
    graph: Graph,
    signature: Vec<ParameterInfo>,
    state: Mutex<NodeState>,
}

struct NodeState {
    arguments: Vec<Option<Reference>>,
    attributes: KernelAttributes,
    executions: u32,
}

impl NodeObject {
    /// Release the node's holds on its arguments and kernel.
    pub(crate) fn destruct(&self, ctx: &Context) -> VxResult<()> {
        let arguments: Vec<Reference> = self.state.lock().arguments.drain(..).flatten().collect();
        let mut first_error = None;
        for reference in arguments.into_iter().chain(std::iter::once(self.kernel.reference())) {
            if let Err(e) = ctx.decrement(reference, RefKind::Internal) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Everything verification and execution need from a node, copied out.
#[derive(Clone)]
pub(crate) struct NodeSnapshot {
    pub(crate) node: Node,
    pub(crate) kernel_name: String,
    pub(crate) entry: KernelEntry,
    pub(crate) validator: KernelValidator,
    pub(crate) signature: Vec<ParameterInfo>,
    pub(crate) arguments: Vec<Option<Reference>>,
    pub(crate) attributes: KernelAttributes,
}

/// Public description of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    /// Name of the kernel the node runs.
    pub kernel_name: String,
    /// Number of parameter slots.
    pub parameter_count: usize,
    /// Number of bound slots.
    pub bound_count: usize,
    /// Current attributes.
    pub attributes: KernelAttributes,
    /// Times the node has run.
    pub executions: u32,
}

impl Context {
    /// Instantiate a finalized kernel inside `graph`.
    pub fn create_generic_node(&self, graph: Graph, kernel: Kernel) -> VxResult<Node> {
        let graph_entry = self.entry(graph.reference())?;
        let graph_object = graph_entry.graph()?;
        let kernel_entry = self.entry(kernel.reference())?;
        let kernel_object = kernel_entry.kernel()?;
        if !kernel_object.is_enabled() {
            return Err(VxError::InvalidParameters(format!(
                "{} is not finalized",
                kernel_object.name()
            )));
        }
        let max_nodes = self.config().max_nodes;
        if graph_object.node_count() >= max_nodes {
            return Err(VxError::NoResources(format!(
                "{} already holds {} nodes",
                graph, max_nodes
            )));
        }

        let signature: Vec<ParameterInfo> = kernel_object.signature().into_iter().flatten().collect();
        let object = NodeObject {
            kernel,
            graph,
            state: Mutex::new(NodeState {
                arguments: vec![None; signature.len()],
                attributes: kernel_object.attributes(),
                executions: 0,
            }),
            signature,
        };
        let reference = self.create_reference(NewReference::external(Object::Node(object)))?;
        let node = Node::wrap(reference);
        if let Err(e) = self.increment(kernel.reference(), RefKind::Internal) {
            // Nothing is bound yet, so the node tears down cleanly.
            self.decrement(reference, RefKind::External)?;
            return Err(e);
        }
        self.increment(reference, RefKind::Internal)?;
        graph_object.add_node(node);
        debug!("node {} of {} in {}", node, kernel_object.name(), graph);
        Ok(node)
    }

    /// Bind `value` to parameter slot `index`, replacing any earlier binding.
    ///
    /// `None` clears the slot and is only allowed for optional slots. Virtual
    /// objects may only be bound inside the graph they were created for.
    pub fn set_parameter_by_index(
        &self,
        node: Node,
        index: usize,
        value: Option<Reference>,
    ) -> VxResult<()> {
        let entry = self.entry(node.reference())?;
        let object = entry.node()?;
        let slot = object.signature.get(index).ok_or_else(|| {
            VxError::InvalidValue(format!(
                "{} has {} parameters, not {}",
                node,
                object.signature.len(),
                index + 1
            ))
        })?;

        match value {
            None if slot.state == ParameterState::Required => {
                return Err(VxError::InvalidParameters(format!(
                    "parameter {} of {} is required",
                    index, node
                )));
            }
            None => {}
            Some(reference) => {
                let bound = self.entry(reference)?;
                if !slot.ty.accepts(reference.ty()) {
                    return Err(VxError::invalid_type(slot.ty, reference.ty()));
                }
                if let Some(scope) = bound.header.scope() {
                    if scope != object.graph {
                        return Err(VxError::InvalidParameters(format!(
                            "{} is virtual in {}, node is in {}",
                            reference, scope, object.graph
                        )));
                    }
                }
                self.increment(reference, RefKind::Internal)?;
            }
        }

        let previous = std::mem::replace(&mut object.state.lock().arguments[index], value);
        self.mark_unverified(object.graph)?;
        if let Some(previous) = previous {
            self.decrement(previous, RefKind::Internal)?;
        }
        Ok(())
    }

    /// Object bound to parameter slot `index`, if any. The handle is not
    /// retained.
    pub fn parameter_by_index(&self, node: Node, index: usize) -> VxResult<Option<Reference>> {
        let entry = self.entry(node.reference())?;
        let state = entry.node()?.state.lock();
        state.arguments.get(index).copied().ok_or_else(|| {
            VxError::InvalidValue(format!("{} has {} parameters", node, state.arguments.len()))
        })
    }

    /// Override one of the attributes the node copied from its kernel.
    ///
    /// Only allowed while the graph is unverified. A self-managed border
    /// cannot be changed.
    pub fn set_node_attribute(&self, node: Node, attribute: KernelAttribute) -> VxResult<()> {
        let entry = self.entry(node.reference())?;
        let object = entry.node()?;
        if self.is_graph_verified(object.graph) {
            return Err(VxError::NotSupported(format!(
                "{} belongs to verified {}",
                node, object.graph
            )));
        }
        let mut state = object.state.lock();
        if let KernelAttribute::Border(mode) = attribute {
            if state.attributes.border == BorderMode::SelfManaged && mode != BorderMode::SelfManaged {
                return Err(VxError::NotSupported(format!("{} manages its own border", node)));
            }
        }
        state.attributes.apply(attribute)
    }

    /// Describe a node.
    pub fn query_node(&self, node: Node) -> VxResult<NodeInfo> {
        let entry = self.entry(node.reference())?;
        let object = entry.node()?;
        let kernel_name = self.entry(object.kernel.reference())?.kernel()?.name().to_string();
        let state = object.state.lock();
        Ok(NodeInfo {
            kernel_name,
            parameter_count: object.signature.len(),
            bound_count: state.arguments.iter().flatten().count(),
            attributes: state.attributes,
            executions: state.executions,
        })
    }

    /// Take a node out of its graph and drop the caller's reference.
    pub fn remove_node(&self, node: Node) -> VxResult<()> {
        let entry = self.entry(node.reference())?;
        let graph = entry.node()?.graph;
        if !self.entry(graph.reference())?.graph()?.remove_node(node) {
            return Err(VxError::InvalidReference(format!("{} is not in {}", node, graph)));
        }
        self.mark_unverified(graph)?;
        if self.query_reference(node)?.external_count > 0 {
            self.decrement(node.reference(), RefKind::External)?;
        }
        self.decrement(node.reference(), RefKind::Internal)?;
        debug!("removed {} from {}", node, graph);
        Ok(())
    }

    pub(crate) fn node_snapshot(&self, node: Node) -> VxResult<NodeSnapshot> {
        let entry = self.entry(node.reference())?;
        let object = entry.node()?;
        let kernel_entry = self.entry(object.kernel.reference())?;
        let kernel = kernel_entry.kernel()?;
        let state = object.state.lock();
        Ok(NodeSnapshot {
            node,
            kernel_name: kernel.name().to_string(),
            entry: kernel.entry().clone(),
            validator: kernel.validator().clone(),
            signature: object.signature.clone(),
            arguments: state.arguments.clone(),
            attributes: state.attributes,
        })
    }

    pub(crate) fn record_execution(&self, node: Node) -> VxResult<()> {
        self.entry(node.reference())?.node()?.state.lock().executions += 1;
        Ok(())
    }
}
