//! Verification pipeline implementation.

use crate::core::context::Context;
use crate::core::error::{StepReport, VxResult};
use crate::core::reference::{Graph, Node};
use crate::validation::stages::{
    BindingValidation, KernelValidation, OrderingValidation, TilingValidation, Verification,
    VerificationStage,
};
use log::{debug, warn};
use std::time::{Duration, Instant};

/// Multi-stage verification pipeline.
///
/// Runs its stages in order and stops at the first failure; the error names
/// the failing stage and the stages that passed before it.
pub struct VerificationPipeline {
    stages: Vec<Box<dyn VerificationStage>>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationSummary {
    /// Execution order chosen for the graph.
    pub order: Vec<Node>,
    /// Stages that ran, in order.
    pub stages: Vec<String>,
    /// Wall time of the run.
    pub duration: Duration,
}

impl VerificationPipeline {
    /// Create a pipeline with the given stages.
    pub fn new(stages: Vec<Box<dyn VerificationStage>>) -> Self {
        Self { stages }
    }

    /// The standard stages: bindings, ordering, kernel validators, tiling.
    pub fn default_pipeline() -> Self {
        Self {
            stages: vec![
                Box::new(BindingValidation),
                Box::new(OrderingValidation),
                Box::new(KernelValidation),
                Box::new(TilingValidation),
            ],
        }
    }

    /// Append a stage.
    pub fn add_stage(&mut self, stage: Box<dyn VerificationStage>) {
        self.stages.push(stage);
    }

    /// Verify `graph`. On success the graph is marked verified with the
    /// chosen execution order; on failure it stays unverified.
    pub fn verify(&self, ctx: &Context, graph: Graph) -> VxResult<VerificationSummary> {
        let start = Instant::now();
        ctx.mark_unverified(graph)?;
        let mut verification = Verification::new(ctx, graph)?;
        let mut report = StepReport::new();
        for stage in &self.stages {
            let result = report.run(stage.name(), || stage.run(&mut verification));
            if let Err(e) = result {
                warn!("verification of {} failed: {}", graph, e);
                return Err(e);
            }
        }
        let order = verification.into_order();
        ctx.mark_verified(graph, order.clone())?;
        let summary = VerificationSummary {
            order,
            stages: report.completed().to_vec(),
            duration: start.elapsed(),
        };
        debug!("{} verified in {:?}", graph, summary.duration);
        Ok(summary)
    }
}

impl Default for VerificationPipeline {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

impl Context {
    /// Verify a graph with the standard pipeline.
    pub fn verify_graph(&self, graph: Graph) -> VxResult<VerificationSummary> {
        VerificationPipeline::default_pipeline().verify(self, graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{Status, VxError};
    use crate::core::reference::{Handle, Reference};
    use crate::core::types::{DataType, Direction, ParameterState, ParameterType};
    use crate::kernels::kernel::{KernelFunction, KernelValidator, MetaFormat};
    use std::sync::Arc;

    fn doubling_kernel(ctx: &Context) -> crate::core::reference::Kernel {
        let function: KernelFunction = Arc::new(|_: &Context, _: Node, _: &[Option<Reference>]| Ok(()));
        let validator = KernelValidator::per_parameter(
            |_: &Context, _: Node, _: usize| Ok(()),
            |ctx: &Context, node: Node, index: usize, meta: &mut MetaFormat| {
                let input = ctx
                    .parameter_by_index(node, 0)?
                    .and_then(|r| r.downcast())
                    .ok_or_else(|| VxError::InvalidParameters("input".into()))?;
                let info = ctx.query_array(input)?;
                let item_type = info.item_type.ok_or_else(|| VxError::InvalidParameters("type".into()))?;
                assert_eq!(index, 1);
                meta.set_array(item_type, info.capacity * 2);
                Ok(())
            },
        );
        let kernel = ctx.register_kernel("test.double", 10, function, 2, validator).unwrap();
        ctx.add_kernel_parameter(kernel, 0, Direction::Input, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.add_kernel_parameter(kernel, 1, Direction::Output, ParameterType::Array, ParameterState::Required)
            .unwrap();
        ctx.finalize_kernel(kernel).unwrap();
        kernel
    }

    #[test]
    fn test_virtual_chain_sized_in_order() {
        let ctx = Context::new();
        let kernel = doubling_kernel(&ctx);
        let graph = ctx.create_graph().unwrap();
        let input = ctx.create_array(DataType::Int16, 3).unwrap();
        let middle = ctx.create_virtual_array(graph, None, 0).unwrap();
        let output = ctx.create_array(DataType::Int16, 12).unwrap();

        // Downstream node created first; ordering must run it second.
        let second = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(second, 0, Some(middle.reference())).unwrap();
        ctx.set_parameter_by_index(second, 1, Some(output.reference())).unwrap();
        let first = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(first, 0, Some(input.reference())).unwrap();
        ctx.set_parameter_by_index(first, 1, Some(middle.reference())).unwrap();

        let summary = ctx.verify_graph(graph).unwrap();
        assert_eq!(summary.order, vec![first, second]);
        assert_eq!(summary.stages.len(), 4);
        assert!(ctx.is_graph_verified(graph));
        assert_eq!(ctx.execution_order(graph).unwrap(), vec![first, second]);

        let info = ctx.query_array(middle).unwrap();
        assert_eq!((info.item_type, info.capacity), (Some(DataType::Int16), 6));
    }

    #[test]
    fn test_failure_names_stage() {
        let ctx = Context::new();
        let kernel = doubling_kernel(&ctx);
        let graph = ctx.create_graph().unwrap();
        let input = ctx.create_array(DataType::Int16, 3).unwrap();
        let small = ctx.create_array(DataType::Int16, 5).unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        ctx.set_parameter_by_index(node, 0, Some(input.reference())).unwrap();
        ctx.set_parameter_by_index(node, 1, Some(small.reference())).unwrap();

        let err = ctx.verify_graph(graph).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
        assert_eq!(err.failed_step(), Some("kernel validators"));
        assert_eq!(err.completed_steps(), &["bindings".to_string(), "ordering".to_string()]);
        assert!(!ctx.is_graph_verified(graph));
    }

    struct Refuse;

    impl VerificationStage for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        fn run(&self, verification: &mut Verification<'_>) -> VxResult<()> {
            Err(VxError::NotSupported(format!("{} nodes", verification.nodes().len())))
        }
    }

    #[test]
    fn test_custom_stage() {
        let ctx = Context::new();
        let kernel = doubling_kernel(&ctx);
        let graph = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        let a = ctx.create_array(DataType::UInt8, 1).unwrap();
        let b = ctx.create_array(DataType::UInt8, 2).unwrap();
        ctx.set_parameter_by_index(node, 0, Some(a.reference())).unwrap();
        ctx.set_parameter_by_index(node, 1, Some(b.reference())).unwrap();

        let mut pipeline = VerificationPipeline::default_pipeline();
        pipeline.add_stage(Box::new(Refuse));
        let err = pipeline.verify(&ctx, graph).unwrap_err();
        assert_eq!(err.failed_step(), Some("refuse"));
        assert_eq!(err.completed_steps().len(), 4);
    }
}
