//! Kernel descriptors and the per-context kernel registry.

pub mod kernel;
pub(crate) mod registry;

pub use kernel::{
    scalar_argument, KernelAttribute, KernelAttributes, KernelFunction, KernelInfo,
    KernelValidator, MetaFormat, ParameterInfo, TileEntry, TileFunction, DEFAULT_BACKEND,
    TILING_BACKEND,
};
