//! Core runtime: contexts, references, errors and the memory-access protocol.
//!
//! This module contains the foundations every object kind builds on:
//! - Error types and the status taxonomy
//! - Shared enums (data types, usage, directions, border modes)
//! - The reference table with dual internal/external counting
//! - Storage, buffer locks and the accessor/memory-map session tables
//! - Context configuration

pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod reference;
pub mod types;

// Re-export commonly used types
pub use config::ContextConfig;
pub use context::{Context, ContextId};
pub use error::{Status, StepReport, VxError, VxResult};
pub use memory::{MapLayout, Mapping, SessionId};
pub use reference::{
    Array, Graph, Handle, Image, Kernel, Node, RefCounts, RefKind, Reference, ReferenceInfo,
    Scalar, Tensor,
};
pub use types::{
    BorderMode, DataType, Direction, ImageFormat, ParameterState, ParameterType, ReferenceType,
    Usage,
};
