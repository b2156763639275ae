//! Individual verification stages.
//!
//! Each stage checks one category of problems and may record results (the
//! execution order, initialized virtual objects) for the stages after it.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::{Array, Graph, Image, Node, Reference, Scalar, Tensor};
use crate::core::types::{Direction, ParameterState, ReferenceType};
use crate::graph::node::NodeSnapshot;
use crate::graph::topology::TopologyAnalyzer;
use crate::kernels::kernel::{check_tile_border, KernelEntry, KernelValidator, MetaFormat};
use crate::tiling::scheduler::plan_tiles;
use log::{debug, trace};

/// State shared by the stages of one verification run.
pub struct Verification<'a> {
    ctx: &'a Context,
    graph: Graph,
    pub(crate) nodes: Vec<NodeSnapshot>,
    order: Vec<Node>,
}

impl<'a> Verification<'a> {
    pub(crate) fn new(ctx: &'a Context, graph: Graph) -> VxResult<Self> {
        let nodes = ctx
            .graph_nodes(graph)?
            .into_iter()
            .map(|node| ctx.node_snapshot(node))
            .collect::<VxResult<Vec<_>>>()?;
        Ok(Self {
            ctx,
            graph,
            nodes,
            order: Vec::new(),
        })
    }

    /// The context being verified against.
    pub fn context(&self) -> &Context {
        self.ctx
    }

    /// The graph under verification.
    pub fn graph(&self) -> Graph {
        self.graph
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.node).collect()
    }

    /// Execution order, once the ordering stage has run.
    pub fn order(&self) -> &[Node] {
        &self.order
    }

    pub(crate) fn into_order(self) -> Vec<Node> {
        self.order
    }

    fn snapshot(&self, node: Node) -> VxResult<&NodeSnapshot> {
        self.nodes
            .iter()
            .find(|n| n.node == node)
            .ok_or_else(|| VxError::InvalidReference(format!("{} left {}", node, self.graph)))
    }
}

/// One step of graph verification.
pub trait VerificationStage: Send + Sync {
    /// Name reported when the stage fails.
    fn name(&self) -> &str;

    /// Check the graph, failing on the first problem.
    fn run(&self, verification: &mut Verification<'_>) -> VxResult<()>;
}

/// Binding checks.
///
/// Verifies:
/// - The graph has at least one node
/// - Every required slot is bound
/// - Every bound object is still alive and has the slot's type
pub struct BindingValidation;

impl VerificationStage for BindingValidation {
    fn name(&self) -> &str {
        "bindings"
    }

    fn run(&self, verification: &mut Verification<'_>) -> VxResult<()> {
        if verification.nodes.is_empty() {
            return Err(VxError::InvalidParameters(format!(
                "{} has no nodes",
                verification.graph
            )));
        }
        for snapshot in &verification.nodes {
            for (index, (slot, argument)) in
                snapshot.signature.iter().zip(&snapshot.arguments).enumerate()
            {
                match argument {
                    None if slot.state == ParameterState::Required => {
                        return Err(VxError::InvalidParameters(format!(
                            "parameter {} of {} ({}) is not bound",
                            index, snapshot.node, snapshot.kernel_name
                        )));
                    }
                    None => {}
                    Some(reference) => {
                        if !verification.ctx.is_valid_reference(*reference) {
                            return Err(VxError::InvalidReference(format!(
                                "parameter {} of {} is stale",
                                index, snapshot.node
                            )));
                        }
                        if !slot.ty.accepts(reference.ty()) {
                            return Err(VxError::invalid_type(slot.ty, reference.ty()));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Data-flow ordering.
///
/// Verifies that no object has two writers and that the writer-to-reader
/// links form no cycle, then records the execution order.
pub struct OrderingValidation;

impl VerificationStage for OrderingValidation {
    fn name(&self) -> &str {
        "ordering"
    }

    fn run(&self, verification: &mut Verification<'_>) -> VxResult<()> {
        let analyzer = TopologyAnalyzer::new(&verification.nodes)?;
        verification.order = analyzer.topological_sort()?;
        debug!(
            "{}: {} nodes, {} data-flow links",
            verification.graph,
            verification.order.len(),
            analyzer.edge_count()
        );
        Ok(())
    }
}

/// Kernel validators.
///
/// Runs each node's validator in execution order. Output meta formats size
/// virtual outputs and are checked against real ones; afterwards every
/// virtual output must be fully described.
pub struct KernelValidation;

impl VerificationStage for KernelValidation {
    fn name(&self) -> &str {
        "kernel validators"
    }

    fn run(&self, verification: &mut Verification<'_>) -> VxResult<()> {
        let ctx = verification.ctx;
        let order = if verification.order.is_empty() {
            verification.nodes()
        } else {
            verification.order.clone()
        };
        for node in order {
            let snapshot = verification.snapshot(node)?;
            let mut metas = vec![MetaFormat::Unset; snapshot.signature.len()];
            match &snapshot.validator {
                KernelValidator::Whole(validate) => {
                    validate(ctx, node, &snapshot.arguments, &mut metas)?;
                }
                KernelValidator::PerParameter { input, output } => {
                    for (index, (slot, argument)) in
                        snapshot.signature.iter().zip(&snapshot.arguments).enumerate()
                    {
                        if argument.is_none() {
                            continue;
                        }
                        if slot.direction == Direction::Output {
                            output(ctx, node, index, &mut metas[index])?;
                        } else {
                            input(ctx, node, index)?;
                        }
                    }
                }
            }
            for (index, (slot, argument)) in
                snapshot.signature.iter().zip(&snapshot.arguments).enumerate()
            {
                let Some(reference) = *argument else { continue };
                if slot.direction != Direction::Output {
                    continue;
                }
                apply_meta_format(ctx, reference, &metas[index]).map_err(|e| {
                    VxError::Step {
                        step: format!("output {} of {}", index, node),
                        completed: Vec::new(),
                        source: Box::new(e),
                    }
                })?;
                check_described(ctx, reference)?;
            }
            trace!("{} ({}) validated", node, snapshot.kernel_name);
        }
        Ok(())
    }
}

/// Bring `reference` in line with `meta`: virtual objects take the
/// description, real objects must already match it.
pub(crate) fn apply_meta_format(ctx: &Context, reference: Reference, meta: &MetaFormat) -> VxResult<()> {
    let is_virtual = ctx.query_reference(reference)?.is_virtual;
    let mismatch = |what: String| {
        Err(VxError::InvalidParameters(format!("{} does not match {}", reference, what)))
    };
    match (meta, reference.ty()) {
        (MetaFormat::Unset, _) => Ok(()),
        (MetaFormat::Array { item_type, capacity }, ReferenceType::Array) => {
            let array = downcast::<Array>(reference)?;
            if is_virtual {
                return ctx.init_virtual_array(array, *item_type, *capacity);
            }
            let info = ctx.query_array(array)?;
            if info.item_type != Some(*item_type) || info.capacity < *capacity {
                return mismatch(format!("{} x {}", capacity, item_type));
            }
            Ok(())
        }
        (MetaFormat::Image { width, height, format }, ReferenceType::Image) => {
            let image = downcast::<Image>(reference)?;
            if is_virtual {
                return ctx.init_virtual_image(image, *width, *height, *format);
            }
            let info = ctx.query_image(image)?;
            if (info.width, info.height, info.format) != (*width, *height, Some(*format)) {
                return mismatch(format!("{}x{} {}", width, height, format));
            }
            Ok(())
        }
        (
            MetaFormat::Tensor {
                dims,
                data_type,
                fixed_point_position,
            },
            ReferenceType::Tensor,
        ) => {
            let info = ctx.query_tensor(downcast::<Tensor>(reference)?)?;
            if &info.dims != dims
                || info.data_type != *data_type
                || info.fixed_point_position != *fixed_point_position
            {
                return mismatch(format!("{:?} {}", dims, data_type));
            }
            Ok(())
        }
        (MetaFormat::Scalar { data_type }, ReferenceType::Scalar) => {
            let value = ctx.read_scalar(downcast::<Scalar>(reference)?)?;
            if value.data_type() != *data_type {
                return Err(VxError::invalid_type(data_type, value.data_type()));
            }
            Ok(())
        }
        (other, ty) => Err(VxError::invalid_type(format!("{:?}", other), ty)),
    }
}

fn downcast<H: crate::core::reference::Handle>(reference: Reference) -> VxResult<H> {
    reference
        .downcast::<H>()
        .ok_or_else(|| VxError::invalid_type(H::TYPE, reference.ty()))
}

/// Fail when a virtual output is still missing attributes.
fn check_described(ctx: &Context, reference: Reference) -> VxResult<()> {
    if !ctx.query_reference(reference)?.is_virtual {
        return Ok(());
    }
    let described = match reference.ty() {
        ReferenceType::Array => {
            let info = ctx.query_array(downcast::<Array>(reference)?)?;
            info.item_type.is_some() && info.capacity > 0
        }
        ReferenceType::Image => {
            let info = ctx.query_image(downcast::<Image>(reference)?)?;
            info.width > 0 && info.height > 0 && info.format.is_some()
        }
        _ => true,
    };
    if !described {
        return Err(VxError::InvalidParameters(format!(
            "virtual {} was left undescribed by its writer",
            reference
        )));
    }
    Ok(())
}

/// Tiling checks.
///
/// Verifies for every tiling node:
/// - The border mode is one the tile scheduler supports
/// - The image arguments all have the size of the tile grid
/// - A kernel with only a fast entry point gets tiles it may run on
pub struct TilingValidation;

impl VerificationStage for TilingValidation {
    fn name(&self) -> &str {
        "tiling"
    }

    fn run(&self, verification: &mut Verification<'_>) -> VxResult<()> {
        let ctx = verification.ctx;
        for snapshot in &verification.nodes {
            let KernelEntry::Tiled(entry) = &snapshot.entry else {
                continue;
            };
            check_tile_border(snapshot.attributes.border)?;
            let mut sizes = snapshot
                .arguments
                .iter()
                .flatten()
                .filter_map(|r| r.downcast::<Image>())
                .map(|image| ctx.query_image(image).map(|info| (info.width, info.height)));
            let Some(first) = sizes.next().transpose()? else {
                return Err(VxError::InvalidParameters(format!(
                    "tiling node {} has no image argument",
                    snapshot.node
                )));
            };
            for size in sizes {
                let size = size?;
                if size != first {
                    return Err(VxError::InvalidParameters(format!(
                        "tiling node {} mixes {:?} and {:?} images",
                        snapshot.node, first, size
                    )));
                }
            }
            plan_tiles(
                first.0,
                first.1,
                snapshot.attributes.tile_block,
                &snapshot.attributes.neighborhood,
                entry,
                ctx.config().fast_tile_policy,
            )?;
        }
        Ok(())
    }
}
