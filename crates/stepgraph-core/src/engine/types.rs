//! Task and graph definition types

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::CachePolicy;
use crate::error::{GraphError, Result};
use crate::interrupt::{InterruptRecord, TaskContext};
use crate::retry::RetryPolicy;
use stepgraph_checkpoint::Channel;

/// Channel names reserved for engine bookkeeping.
pub const RESERVED_CHANNELS: &[&str] = &["__input__", "__interrupt__", "__error__"];

/// Writer name used when seeding input channels.
pub const INPUT_WRITER: &str = "__input__";

/// Pending-write channel that carries interrupt records.
pub const INTERRUPT_CHANNEL: &str = "__interrupt__";

pub type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// A node body. Receives the frozen input snapshot and the per-execution
/// context; returns the value routed to the node's declared writes.
pub trait NodeExecutor: Send + Sync {
    fn execute<'a>(&'a self, input: Value, ctx: &'a TaskContext) -> NodeFuture<'a>;
}

struct FnExecutor<F>(F);

impl<F> NodeExecutor for FnExecutor<F>
where
    F: for<'a> Fn(Value, &'a TaskContext) -> NodeFuture<'a> + Send + Sync,
{
    fn execute<'a>(&'a self, input: Value, ctx: &'a TaskContext) -> NodeFuture<'a> {
        (self.0)(input, ctx)
    }
}

/// Wrap a closure as a [`NodeExecutor`].
///
/// ```rust
/// use stepgraph_core::engine::node_fn;
/// let node = node_fn(|input, _ctx| {
///     Box::pin(async move { Ok(input) })
/// });
/// ```
pub fn node_fn<F>(f: F) -> Arc<dyn NodeExecutor>
where
    F: for<'a> Fn(Value, &'a TaskContext) -> NodeFuture<'a> + Send + Sync + 'static,
{
    Arc::new(FnExecutor(f))
}

/// One declared write target of a node.
#[derive(Clone)]
pub struct ChannelWrite {
    pub channel: String,
    /// Applied to the routed value before commit
    pub transform: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
    /// Skip the write when the transformed value equals the channel's
    /// current value
    pub only_if_changed: bool,
}

impl ChannelWrite {
    pub fn to(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            transform: None,
            only_if_changed: false,
        }
    }

    pub fn with_transform(
        mut self,
        transform: Arc<dyn Fn(Value) -> Value + Send + Sync>,
    ) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn only_if_changed(mut self) -> Self {
        self.only_if_changed = true;
        self
    }
}

impl fmt::Debug for ChannelWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWrite")
            .field("channel", &self.channel)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("only_if_changed", &self.only_if_changed)
            .finish()
    }
}

/// Static description of a unit of work: what triggers it, what it reads,
/// what it may write, and how failures are handled. Node registration
/// order is the commit order for the whole graph.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Channels whose version change makes this node eligible to run
    pub triggers: Vec<String>,
    /// Channels consulted for input without triggering; defaults to
    /// `triggers` when empty
    pub reads: Vec<String>,
    pub writes: Vec<ChannelWrite>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub executor: Arc<dyn NodeExecutor>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            retry_policy: None,
            cache_policy: None,
            executor,
        }
    }

    pub fn with_trigger(mut self, channel: impl Into<String>) -> Self {
        self.triggers.push(channel.into());
        self
    }

    pub fn with_read(mut self, channel: impl Into<String>) -> Self {
        self.reads.push(channel.into());
        self
    }

    pub fn with_write(mut self, write: ChannelWrite) -> Self {
        self.writes.push(write);
        self
    }

    pub fn writes_to(mut self, channel: impl Into<String>) -> Self {
        self.writes.push(ChannelWrite::to(channel));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Channels read for the input snapshot.
    pub fn read_channels(&self) -> &[String] {
        if self.reads.is_empty() {
            &self.triggers
        } else {
            &self.reads
        }
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

/// The complete graph definition: channels plus nodes in registration
/// order. Cycles in the subscription topology are expected; supersteps are
/// the iteration mechanism.
pub struct GraphSpec {
    pub channels: HashMap<String, Box<dyn Channel>>,
    pub nodes: Vec<NodeSpec>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn add_channel(mut self, name: impl Into<String>, channel: Box<dyn Channel>) -> Self {
        self.channels.insert(name.into(), channel);
        self
    }

    pub fn add_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Reject invalid definitions before any superstep runs.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if RESERVED_CHANNELS.contains(&node.name.as_str()) {
                return Err(GraphError::validation(format!(
                    "node name '{}' is reserved",
                    node.name
                )));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(GraphError::validation(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
            for trigger in &node.triggers {
                if !self.channels.contains_key(trigger) {
                    return Err(GraphError::validation(format!(
                        "node '{}' subscribes to unknown channel '{}'",
                        node.name, trigger
                    )));
                }
            }
            for read in &node.reads {
                if !self.channels.contains_key(read) {
                    return Err(GraphError::validation(format!(
                        "node '{}' reads unknown channel '{}'",
                        node.name, read
                    )));
                }
            }
            for write in &node.writes {
                if !self.channels.contains_key(&write.channel) {
                    return Err(GraphError::validation(format!(
                        "node '{}' writes to unknown channel '{}'",
                        node.name, write.channel
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for GraphSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// An ephemeral per-superstep task instance prepared from a [`NodeSpec`].
#[derive(Clone)]
pub struct ExecutableTask {
    /// `{checkpoint_id}:{node}`; stable for replays of the same step
    pub id: String,
    pub name: String,
    /// Frozen input snapshot taken at preparation time
    pub input: Value,
    pub triggers: Vec<String>,
    pub writes: Vec<ChannelWrite>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub executor: Arc<dyn NodeExecutor>,
}

impl fmt::Debug for ExecutableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("input", &self.input)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

/// Terminal outcome of one task execution.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Node body returned a value (not yet routed to channel writes)
    Success(Value),
    /// Retries exhausted or a non-retryable error
    Failed(GraphError),
    /// A governing cancellation signal fired
    Cancelled,
    /// The task suspended; records are in call order
    Interrupted(Vec<InterruptRecord>),
}

/// One task's result within a step report.
#[derive(Debug)]
pub struct TaskResult {
    pub task_id: String,
    pub name: String,
    pub outcome: TaskOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_checkpoint::LastValueChannel;

    fn noop() -> Arc<dyn NodeExecutor> {
        node_fn(|input, _ctx| Box::pin(async move { Ok(input) }))
    }

    fn graph_with(node: NodeSpec) -> GraphSpec {
        GraphSpec::new()
            .add_channel("state", Box::new(LastValueChannel::new("state")))
            .add_node(node)
    }

    #[test]
    fn valid_graph_passes() {
        let graph = graph_with(
            NodeSpec::new("worker", noop())
                .with_trigger("state")
                .writes_to("state"),
        );
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn reserved_node_name_rejected() {
        let graph = graph_with(NodeSpec::new("__input__", noop()).with_trigger("state"));
        assert!(matches!(
            graph.validate().unwrap_err(),
            GraphError::Validation(_)
        ));
    }

    #[test]
    fn unknown_trigger_rejected() {
        let graph = graph_with(NodeSpec::new("worker", noop()).with_trigger("missing"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn unknown_write_target_rejected() {
        let graph = graph_with(
            NodeSpec::new("worker", noop())
                .with_trigger("state")
                .writes_to("missing"),
        );
        assert!(graph.validate().is_err());
    }

    #[test]
    fn duplicate_node_names_rejected() {
        let graph = GraphSpec::new()
            .add_channel("state", Box::new(LastValueChannel::new("state")))
            .add_node(NodeSpec::new("worker", noop()).with_trigger("state"))
            .add_node(NodeSpec::new("worker", noop()).with_trigger("state"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn reads_default_to_triggers() {
        let node = NodeSpec::new("worker", noop())
            .with_trigger("a")
            .with_trigger("b");
        assert_eq!(node.read_channels(), &["a", "b"]);

        let node = node.with_read("c");
        assert_eq!(node.read_channels(), &["c"]);
    }
}
