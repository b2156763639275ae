//! Graph processing.
//!
//! Runs the nodes of a verified graph in dependency order. Plain kernels get
//! one call per node; tiling kernels are handed to the tile scheduler.

use crate::core::context::Context;
use crate::core::error::{StepReport, VxResult};
use crate::core::reference::{Graph, Reference};
use crate::graph::node::NodeSnapshot;
use crate::kernels::kernel::KernelEntry;
use crate::tiling::scheduler::{TileDispatch, TilingOptions, TilingStats};
use indexmap::IndexSet;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Processing options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// How tiling nodes walk their tiles.
    pub tiling: TilingOptions,
    /// Verify again even when the graph is already verified.
    pub force_verify: bool,
}

impl ExecutionOptions {
    /// Default options: sequential tiles, verify only when needed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk tiles on the rayon pool.
    pub fn with_parallel_tiles(mut self, parallel: bool) -> Self {
        self.tiling.parallel = parallel;
        self
    }

    /// Worker threads for parallel tiles (0 = rayon's global pool).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.tiling.num_threads = threads;
        self
    }

    /// Always run verification first.
    pub fn with_force_verify(mut self, force: bool) -> Self {
        self.force_verify = force;
        self
    }
}

/// Counters for one graph run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    /// Nodes that ran to completion.
    pub nodes_executed: usize,
    /// Tile counters summed over every tiling node.
    pub tiles: TilingStats,
    /// Wall time, verification included.
    pub total_duration: Duration,
}

impl Context {
    /// Process a graph with default options.
    pub fn process_graph(&self, graph: Graph) -> VxResult<ExecutionStats> {
        self.process_graph_with(graph, &ExecutionOptions::default())
    }

    /// Process a graph.
    ///
    /// The graph is verified first when it is not verified yet. Virtual
    /// objects bound in the graph are accessible while the nodes run and are
    /// hidden again afterwards. Processing stops at the first failing node;
    /// the error names that node and the nodes that completed.
    pub fn process_graph_with(
        &self,
        graph: Graph,
        options: &ExecutionOptions,
    ) -> VxResult<ExecutionStats> {
        let start = Instant::now();
        if options.force_verify || !self.is_graph_verified(graph) {
            self.verify_graph(graph)?;
        }
        let nodes = self
            .execution_order(graph)?
            .into_iter()
            .map(|node| self.node_snapshot(node))
            .collect::<VxResult<Vec<_>>>()?;

        let virtuals = self.bound_virtuals(&nodes)?;
        for reference in &virtuals {
            self.set_accessible(*reference, true)?;
        }

        let mut stats = ExecutionStats::default();
        let mut report = StepReport::new();
        let mut result = Ok(());
        for snapshot in &nodes {
            let step = format!("{} ({})", snapshot.node, snapshot.kernel_name);
            result = report.run(step, || self.run_node(snapshot, options, &mut stats));
            if result.is_err() {
                break;
            }
        }

        for reference in &virtuals {
            if let Err(e) = self.set_accessible(*reference, false) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if let Err(e) = result {
            warn!("processing {} failed: {}", graph, e);
            return Err(e);
        }

        self.record_run(graph)?;
        stats.total_duration = start.elapsed();
        info!(
            "processed {}: {} nodes, {} tiles in {:?}",
            graph, stats.nodes_executed, stats.tiles.tiles, stats.total_duration
        );
        Ok(stats)
    }

    fn run_node(
        &self,
        snapshot: &NodeSnapshot,
        options: &ExecutionOptions,
        stats: &mut ExecutionStats,
    ) -> VxResult<()> {
        match &snapshot.entry {
            KernelEntry::Plain(function) => function(self, snapshot.node, &snapshot.arguments)?,
            KernelEntry::Tiled(entry) => {
                let tiles = self.dispatch_tiles(
                    TileDispatch {
                        entry,
                        attributes: snapshot.attributes,
                        signature: &snapshot.signature,
                        arguments: &snapshot.arguments,
                    },
                    &options.tiling,
                )?;
                stats.tiles.merge(&tiles);
            }
        }
        self.record_execution(snapshot.node)?;
        stats.nodes_executed += 1;
        debug!("ran {} ({})", snapshot.node, snapshot.kernel_name);
        Ok(())
    }

    /// Distinct virtual objects bound to any of `nodes`.
    fn bound_virtuals(&self, nodes: &[NodeSnapshot]) -> VxResult<Vec<Reference>> {
        let mut virtuals = IndexSet::new();
        for reference in nodes.iter().flat_map(|n| n.arguments.iter().flatten()) {
            if self.query_reference(*reference)?.is_virtual {
                virtuals.insert(*reference);
            }
        }
        Ok(virtuals.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::image::Rectangle;
    use crate::core::error::{Status, VxError};
    use crate::core::reference::{Array, Handle, Kernel, Node};
    use crate::core::types::{DataType, Direction, ImageFormat, ParameterState, ParameterType, Usage};
    use crate::kernels::kernel::{
        KernelAttribute, KernelFunction, KernelValidator, MetaFormat, TileEntry, TileFunction,
    };
    use crate::tiling::region::{Neighborhood, TileBlock};
    use crate::tiling::tile::TileParameter;
    use std::sync::Arc;

    fn array_argument(args: &[Option<Reference>], index: usize) -> VxResult<Array> {
        args[index]
            .and_then(|r| r.downcast())
            .ok_or_else(|| VxError::InvalidParameters(format!("argument {}", index)))
    }

    fn same_as_input() -> KernelValidator {
        KernelValidator::per_parameter(
            |_: &Context, _: Node, _: usize| Ok(()),
            |ctx: &Context, node: Node, _: usize, meta: &mut MetaFormat| {
                let input = ctx.parameter_by_index(node, 0)?.and_then(|r| r.downcast());
                let input = input.ok_or_else(|| VxError::InvalidParameters("input".into()))?;
                let info = ctx.query_array(input)?;
                let item_type = info.item_type.ok_or_else(|| VxError::InvalidParameters("type".into()))?;
                meta.set_array(item_type, info.capacity);
                Ok(())
            },
        )
    }

    fn copy_kernel(ctx: &Context) -> Kernel {
        let function: KernelFunction = Arc::new(|ctx: &Context, _: Node, args: &[Option<Reference>]| {
            let input = array_argument(args, 0)?;
            let output = array_argument(args, 1)?;
            let info = ctx.query_array(input)?;
            let mut items = vec![0u8; info.num_items * info.item_size];
            ctx.copy_array_range(input, 0, info.num_items, info.item_size, &mut items, Usage::ReadOnly)?;
            ctx.truncate_array(output, 0)?;
            ctx.add_array_items(output, info.num_items, &items, info.item_size)
        });
        let kernel = ctx.register_kernel("test.copy", 20, function, 2, same_as_input()).unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, Direction::Output, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        kernel
    }

    #[test]
    fn test_plain_chain_through_virtual_array() {
        let ctx = Context::new();
        let kernel = copy_kernel(&ctx);
        let graph = ctx.create_graph().unwrap();
        let input = ctx.create_array(DataType::UInt16, 4).unwrap();
        let middle = ctx.create_virtual_array(graph, None, 0).unwrap();
        let output = ctx.create_array(DataType::UInt16, 4).unwrap();
        let values: Vec<u8> = bytemuck::cast_slice(&[7u16, 8, 9]).to_vec();
        ctx.add_array_items(input, 3, &values, 2).unwrap();

        let second = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(second, 0, Some(middle.reference())).unwrap();
        ctx.set_parameter_by_index(second, 1, Some(output.reference())).unwrap();
        let first = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(first, 0, Some(input.reference())).unwrap();
        ctx.set_parameter_by_index(first, 1, Some(middle.reference())).unwrap();

        let stats = ctx.process_graph(graph).unwrap();
        assert_eq!(stats.nodes_executed, 2);
        assert_eq!(stats.tiles.tiles, 0);

        let mut result = vec![0u8; 6];
        ctx.copy_array_range(output, 0, 3, 2, &mut result, Usage::ReadOnly).unwrap();
        assert_eq!(result, values);

        // Hidden again once the run is over.
        let err = ctx
            .copy_array_range(middle, 0, 3, 2, &mut result, Usage::ReadOnly)
            .unwrap_err();
        assert_eq!(err.status(), Status::OptimizedAway);

        ctx.process_graph(graph).unwrap();
        assert_eq!(ctx.query_graph(graph).unwrap().runs, 2);
        assert_eq!(ctx.query_node(first).unwrap().executions, 2);
        assert_eq!(ctx.query_array(output).unwrap().num_items, 3);
    }

    fn box_sum() -> TileFunction {
        Arc::new(|params: &mut [TileParameter], _: &mut [u8]| {
            let (input, output) = params.split_at_mut(1);
            let input = input[0].as_image().ok_or_else(|| VxError::invalid_type("image", "other"))?;
            let output = output[0].as_image_mut().ok_or_else(|| VxError::invalid_type("image", "other"))?;
            let block = output.block();
            let (w, h) = (input.image_width() as i64, input.image_height() as i64);
            for y in block.y..block.bottom() {
                for x in block.x..block.right() {
                    let mut sum = 0u8;
                    for (dx, dy) in (-1i64..=1).flat_map(|dx| (-1i64..=1).map(move |dy| (dx, dy))) {
                        let (sx, sy) = (x as i64 + dx, y as i64 + dy);
                        if sx >= 0 && sy >= 0 && sx < w && sy < h {
                            sum += input.read::<u8>(sx as u32, sy as u32)?;
                        }
                    }
                    output.write(x, y, sum)?;
                }
            }
            Ok(())
        })
    }

    #[test]
    fn test_tiling_node_runs_per_tile() {
        let ctx = Context::new();
        let validator = KernelValidator::whole(
            |_: &Context, _: Node, _: &[Option<Reference>], metas: &mut [MetaFormat]| {
                metas[1].set_image(20, 13, ImageFormat::U8);
                Ok(())
            },
        );
        let kernel = ctx
            .add_tiling_kernel("test.box3x3", 21, TileEntry::Flexible(box_sum()), 2, validator)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Image, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, Direction::Output, ParameterType::Image, ParameterState::Required)
            .unwrap();
        ctx.set_kernel_attribute(kernel, KernelAttribute::Neighborhood(Neighborhood::symmetric(1)))
            .unwrap();
        ctx.set_kernel_attribute(kernel, KernelAttribute::TileBlockSize(TileBlock::new(8, 4)))
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();

        let graph = ctx.create_graph().unwrap();
        let input = ctx.create_image(20, 13, ImageFormat::U8).unwrap();
        let output = ctx.create_image(20, 13, ImageFormat::U8).unwrap();
        let mut ones = vec![1u8; 20 * 13];
        ctx.copy_image_patch(input, Rectangle::whole(20, 13), &mut ones, 20, Usage::WriteOnly)
            .unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(node, 0, Some(input.reference())).unwrap();
        ctx.set_parameter_by_index(node, 1, Some(output.reference())).unwrap();

        let options = ExecutionOptions::new().with_parallel_tiles(true).with_threads(2);
        let stats = ctx.process_graph_with(graph, &options).unwrap();
        assert_eq!(stats.nodes_executed, 1);
        assert_eq!((stats.tiles.tiles, stats.tiles.flexible_calls), (12, 12));
        assert_eq!(ctx.active_maps(), 0);

        let mut result = vec![0u8; 20 * 13];
        ctx.copy_image_patch(output, Rectangle::whole(20, 13), &mut result, 20, Usage::ReadOnly)
            .unwrap();
        assert_eq!(result[0], 4);
        assert_eq!(result[20 + 1], 9);
    }

    #[test]
    fn test_failing_node_stops_processing() {
        let ctx = Context::new();
        let copy = copy_kernel(&ctx);
        let failing: KernelFunction = Arc::new(|_: &Context, _: Node, _: &[Option<Reference>]| {
            Err(VxError::NoResources("device busy".into()))
        });
        let sink = ctx.register_kernel("test.sink", 22, failing, 1, same_as_input()).unwrap();
        ctx.add_kernel_parameter(sink, 0, Direction::Input, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.finalize_kernel(sink).unwrap();

        let graph = ctx.create_graph().unwrap();
        let input = ctx.create_array(DataType::UInt8, 2).unwrap();
        ctx.add_array_items(input, 1, &[5], 1).unwrap();
        let middle = ctx.create_virtual_array(graph, None, 0).unwrap();
        let head = ctx.create_generic_node(graph, copy).unwrap();
        ctx.set_parameter_by_index(head, 0, Some(input.reference())).unwrap();
        ctx.set_parameter_by_index(head, 1, Some(middle.reference())).unwrap();
        let tail = ctx.create_generic_node(graph, sink).unwrap();
        ctx.set_parameter_by_index(tail, 0, Some(middle.reference())).unwrap();

        let err = ctx.process_graph(graph).unwrap_err();
        assert_eq!(err.status(), Status::NoResources);
        assert!(err.failed_step().is_some_and(|step| step.contains("test.sink")));
        assert_eq!(err.completed_steps().len(), 1);
        assert!(!ctx.query_reference(middle).unwrap().is_accessible);
        assert_eq!(ctx.query_graph(graph).unwrap().runs, 0);
        assert_eq!(ctx.query_node(head).unwrap().executions, 1);
    }
}
