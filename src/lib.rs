//! # vxcore - dataflow vision runtime core
//!
//! vxcore is the object core of a graph-based vision framework. A host opens
//! a [`Context`](core::Context), creates data objects and kernels, binds the
//! kernels into nodes of a graph, then verifies and processes the graph.
//!
//! ## Features
//!
//! - **Reference lifetimes**: every object carries an external count (held
//!   by the host) and an internal count (held by other objects); it is
//!   destroyed when both reach zero
//! - **Memory access**: copy-style or zero-copy access to arrays, tensors and
//!   images, coordinated by a per-object lock
//! - **Tensor views**: zero-copy sub-views that share their parent's storage
//! - **Kernels**: register, declare parameters, finalize; plain or tiled
//! - **Tile scheduling**: image kernels run once per tile with a declared
//!   halo, through a fast or a boundary-aware entry point
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vxcore::prelude::*;
//! use std::sync::Arc;
//!
//! let ctx = Context::new();
//!
//! let function: KernelFunction = Arc::new(|ctx, _node, args| {
//!     let gain = scalar_argument(ctx, args, 1)?;
//!     // ...
//!     Ok(())
//! });
//! let kernel = ctx.register_kernel("org.example.gain", 1, function, 2, validator)?;
//! ctx.add_kernel_parameter(kernel, 0, Direction::Bidirectional, ParameterType::Array, ParameterState::Required)?;
//! ctx.add_kernel_parameter(kernel, 1, Direction::Input, ParameterType::Scalar, ParameterState::Required)?;
//! ctx.finalize_kernel(kernel)?;
//!
//! let graph = ctx.create_graph()?;
//! let node = ctx.create_generic_node(graph, kernel)?;
//! ctx.set_parameter_by_index(node, 0, Some(samples.reference()))?;
//! ctx.set_parameter_by_index(node, 1, Some(gain.reference()))?;
//!
//! ctx.verify_graph(graph)?;
//! ctx.process_graph(graph)?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: context, reference table, errors and the access protocol
//! - [`buffers`]: arrays, tensors, images and scalars
//! - [`kernels`]: kernel descriptors and the kernel registry
//! - [`graph`]: nodes, graphs and execution ordering
//! - [`tiling`]: tile geometry, tile descriptors and the tile scheduler
//! - [`validation`]: the graph verification pipeline
//! - [`execution`]: graph processing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffers;
pub mod core;
pub mod execution;
pub mod graph;
pub mod kernels;
pub mod tiling;
pub mod validation;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use vxcore::prelude::*;
/// ```
pub mod prelude {
    // Context and configuration
    pub use crate::core::config::ContextConfig;
    pub use crate::core::context::Context;

    // Errors
    pub use crate::core::error::{Status, StepReport, VxError, VxResult};

    // Handles
    pub use crate::core::reference::{
        Array, Graph, Handle, Image, Kernel, Node, RefKind, Reference, ReferenceInfo, Scalar,
        Tensor,
    };
    pub use crate::core::memory::{MapLayout, Mapping};
    pub use crate::core::types::{
        BorderMode, DataType, Direction, ImageFormat, ParameterState, ParameterType,
        ReferenceType, Usage,
    };

    // Data objects
    pub use crate::buffers::{AccessBuffer, ArrayAccess, ArrayInfo, ImageInfo, Rectangle, ScalarValue, TensorInfo};

    // Kernels
    pub use crate::kernels::kernel::{
        scalar_argument, KernelAttribute, KernelAttributes, KernelFunction, KernelInfo,
        KernelValidator, MetaFormat, ParameterInfo, TileEntry, TileFunction,
    };

    // Graphs
    pub use crate::graph::{GraphInfo, NodeInfo};

    // Tiling
    pub use crate::tiling::{
        plan_tiles, FastTilePolicy, ImageTile, Neighborhood, TileBlock, TileIterator,
        TileParameter, TileRegion, TilingOptions, TilingStats,
    };

    // Verification and processing
    pub use crate::execution::{ExecutionOptions, ExecutionStats};
    pub use crate::validation::{VerificationPipeline, VerificationStage, VerificationSummary};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
        assert_eq!(super::NAME, "vxcore");
    }

    #[test]
    fn test_scaled_array_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = Context::new();

        let function: KernelFunction = Arc::new(|ctx: &Context, _: Node, args: &[Option<Reference>]| {
            let gain = scalar_argument(ctx, args, 1)?.as_u32().unwrap_or(1) as u8;
            let samples: Array = args[0]
                .and_then(|r| r.downcast())
                .ok_or_else(|| VxError::InvalidParameters("samples".into()))?;
            let count = ctx.query_array(samples)?.num_items;
            let mut access = ctx.access_array_range(samples, 0, count, AccessBuffer::Framework, Usage::ReadWrite)?;
            for value in access.as_mut_slice()? {
                *value *= gain;
            }
            ctx.commit_array_range(samples, access)
        });
        let validator =
            KernelValidator::whole(|_: &Context, _: Node, _: &[Option<Reference>], _: &mut [MetaFormat]| Ok(()));
        let kernel = ctx.register_kernel("org.example.gain", 1, function, 2, validator).unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Bidirectional, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, Direction::Input, ParameterType::Scalar, ParameterState::Required)
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();

        let samples = ctx.create_array(DataType::UInt8, 4).unwrap();
        ctx.add_array_items(samples, 4, &[1, 2, 3, 4], 1).unwrap();
        let gain = ctx.create_scalar(ScalarValue::U8(3)).unwrap();

        let graph = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(node, 0, Some(samples.reference())).unwrap();
        ctx.set_parameter_by_index(node, 1, Some(gain.reference())).unwrap();
        ctx.verify_graph(graph).unwrap();
        ctx.process_graph(graph).unwrap();

        let mut out = [0u8; 4];
        ctx.copy_array_range(samples, 0, 4, 1, &mut out, Usage::ReadOnly).unwrap();
        assert_eq!(out, [3, 6, 9, 12]);

        ctx.release(node).unwrap();
        ctx.release(graph).unwrap();
        assert_eq!(ctx.query_reference(samples).unwrap().internal_count, 0);
        assert_eq!(ctx.query_reference(kernel).unwrap().internal_count, 1);
    }
}
