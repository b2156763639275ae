//! Graph processing.

pub mod engine;

pub use engine::{ExecutionOptions, ExecutionStats};
