//! Error types for vxcore.
//!
//! Every operation returns a [`VxResult`]. Errors belong to a closed set of
//! status classes ([`Status`]) so a caller can branch on the class while the
//! message still names the object or value that was rejected.
//!
//! Multi-step sequences (graph verification, graph processing) run their
//! sub-steps through a [`StepReport`]: the first failing step stops the
//! sequence and the returned [`VxError::Step`] records both the failing step
//! and every step that completed before it.

use crate::core::reference::Reference;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used by every public operation.
pub type VxResult<T> = Result<T, VxError>;

/// Closed status taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The operation completed.
    Success,
    /// Handle type mismatch or use of an already-destroyed object.
    InvalidReference,
    /// Out-of-range index, size or range; mismatched strides; exceeded capacity.
    InvalidParameters,
    /// A value outside the legal set for an attribute or argument.
    InvalidValue,
    /// A bound object has the wrong type for its slot.
    InvalidType,
    /// An allocation failed.
    NoMemory,
    /// A fixed-size table is full.
    NoResources,
    /// Access to a virtual object that is not currently accessible.
    OptimizedAway,
    /// The request is not valid for the object's current state.
    NotSupported,
}

impl Status {
    /// Whether this status means success.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Short lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::InvalidReference => "invalid-reference",
            Status::InvalidParameters => "invalid-parameters",
            Status::InvalidValue => "invalid-value",
            Status::InvalidType => "invalid-type",
            Status::NoMemory => "no-memory",
            Status::NoResources => "no-resources",
            Status::OptimizedAway => "optimized-away",
            Status::NotSupported => "not-supported",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl<T> From<&VxResult<T>> for Status {
    fn from(result: &VxResult<T>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

/// Errors returned by the runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VxError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid type: expected {expected}, got {got}")]
    InvalidType { expected: String, got: String },

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("no resources: {0}")]
    NoResources(String),

    #[error("{0} is virtual and was optimized away")]
    OptimizedAway(Reference),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("step '{step}' failed after {} completed step(s): {source}", .completed.len())]
    Step {
        step: String,
        completed: Vec<String>,
        #[source]
        source: Box<VxError>,
    },
}

impl VxError {
    /// The status class of this error.
    ///
    /// A step failure reports the class of the error that stopped it.
    pub fn status(&self) -> Status {
        match self {
            VxError::InvalidReference(_) => Status::InvalidReference,
            VxError::InvalidParameters(_) => Status::InvalidParameters,
            VxError::InvalidValue(_) => Status::InvalidValue,
            VxError::InvalidType { .. } => Status::InvalidType,
            VxError::NoMemory(_) => Status::NoMemory,
            VxError::NoResources(_) => Status::NoResources,
            VxError::OptimizedAway(_) => Status::OptimizedAway,
            VxError::NotSupported(_) => Status::NotSupported,
            VxError::Step { source, .. } => source.status(),
        }
    }

    /// The innermost error, looking through step failures.
    pub fn root_cause(&self) -> &VxError {
        match self {
            VxError::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Name of the step that failed, when the error came from a [`StepReport`].
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            VxError::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Steps that completed before the failure.
    pub fn completed_steps(&self) -> &[String] {
        match self {
            VxError::Step { completed, .. } => completed,
            _ => &[],
        }
    }

    pub(crate) fn invalid_type(expected: impl fmt::Display, got: impl fmt::Display) -> Self {
        VxError::InvalidType {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

// ============================================================================
// First-failure step tracking
// ============================================================================

/// Records the named steps of a multi-step operation.
///
/// `run` executes one step. On success the step name is recorded; on failure
/// the error is wrapped with the step name and the list of completed steps,
/// so a caller checks a single `Result` and still knows where it stopped.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    completed: Vec<String>,
}

impl StepReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a step, recording it on success.
    pub fn run<T, F>(&mut self, step: impl Into<String>, f: F) -> VxResult<T>
    where
        F: FnOnce() -> VxResult<T>,
    {
        let step = step.into();
        match f() {
            Ok(value) => {
                self.completed.push(step);
                Ok(value)
            }
            Err(source) => Err(VxError::Step {
                step,
                completed: self.completed.clone(),
                source: Box::new(source),
            }),
        }
    }

    /// Steps completed so far, in order.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Number of completed steps.
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    /// Whether no step has completed yet.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}
