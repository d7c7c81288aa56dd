//! Execution engine: task preparation, the runner, and the superstep loop.

pub mod algo;
pub mod loop_impl;
pub mod runner;
pub mod types;

pub use algo::{apply_writes, prepare_tasks, route_writes, CommittedTask};
pub use loop_impl::{LoopState, RunOutcome, SuperstepLoop};
pub use runner::{StepReport, TaskRunner};
pub use types::{
    node_fn, ChannelWrite, ExecutableTask, GraphSpec, NodeExecutor, NodeFuture, NodeSpec,
    TaskOutcome, TaskResult, INPUT_WRITER, INTERRUPT_CHANNEL, RESERVED_CHANNELS,
};
