//! Graph verification.
//!
//! Verification runs a fixed sequence of stages over a snapshot of the
//! graph's nodes. It fails at the first stage that rejects the graph.

pub mod pipeline;
pub mod stages;

pub use pipeline::{VerificationPipeline, VerificationSummary};
pub use stages::{
    BindingValidation, KernelValidation, OrderingValidation, TilingValidation, Verification,
    VerificationStage,
};
