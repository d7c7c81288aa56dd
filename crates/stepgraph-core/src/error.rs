//! Error types for graph execution

use thiserror::Error;

use crate::interrupt::InterruptRecord;
use stepgraph_checkpoint::CheckpointError;

/// Result type for graph execution
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or running a graph.
///
/// `Interrupted` is a control-flow signal, not a failure: it aborts the
/// remainder of a task body so the loop can suspend, and is turned into a
/// suspended run outcome rather than surfaced as an error.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph definition rejected before any superstep ran
    #[error("Validation error: {0}")]
    Validation(String),

    /// A node body failed
    #[error("Execution error: {0}")]
    Execution(String),

    /// A task failed terminally, with retries exhausted
    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<GraphError>,
    },

    /// Cooperative suspension raised from within a task body
    #[error("Interrupted with {} pending interrupt(s)", .0.len())]
    Interrupted(Vec<InterruptRecord>),

    /// A task was cancelled by a sibling failure, step timeout, or an
    /// external signal
    #[error("Task '{task}' was cancelled")]
    Cancelled { task: String },

    /// The superstep's wall-clock budget expired
    #[error("Step {step} timed out after {duration_ms}ms")]
    StepTimeout { step: i64, duration_ms: u64 },

    /// The loop exceeded its superstep budget
    #[error("Exceeded the maximum of {0} supersteps")]
    MaxStepsExceeded(usize),

    /// Persistence failure, surfaced without internal retry
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Custom error from node logic
    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn task_failed(task: impl Into<String>, source: GraphError) -> Self {
        Self::TaskFailed {
            task: task.into(),
            source: Box::new(source),
        }
    }

    /// Whether this is the cooperative suspension signal.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Whether this came from a cancellation or timeout signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::StepTimeout { .. })
    }
}
