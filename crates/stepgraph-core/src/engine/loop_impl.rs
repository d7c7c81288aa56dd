//! The superstep loop
//!
//! Drives a graph through bulk-synchronous supersteps:
//!
//! ```text
//! Initializing -> RunningStep -> CommittingWrites -> CheckingTermination
//!                      ^                                   |
//!                      +---------- next step --------------+
//!                                  (or Suspended / Completed / Failed)
//! ```
//!
//! Each iteration computes the triggered task set from channel versions,
//! hands it to the [`TaskRunner`], commits the surviving writes in
//! deterministic order, persists a checkpoint when a saver is configured,
//! and then decides whether to loop, suspend on interrupts, finish, or
//! fail. Supersteps are strictly sequential; concurrency exists only
//! within a step.
//!
//! Suspension and resume: an interrupt halts the step without committing
//! the interrupted task's writes or advancing its observed versions, so
//! re-running the loop re-triggers the same task with the same frozen
//! input. Writes of siblings that completed before the interrupt (or
//! before a failure) are persisted as pending writes against the current
//! checkpoint and restored instead of re-executed on the next run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TaskCache;
use crate::engine::algo::{apply_writes, prepare_tasks, route_writes, CommittedTask};
use crate::engine::runner::{StepReport, TaskRunner};
use crate::engine::types::{
    ExecutableTask, GraphSpec, NodeSpec, TaskOutcome, INPUT_WRITER, INTERRUPT_CHANNEL,
};
use crate::error::{GraphError, Result};
use crate::interrupt::InterruptRecord;
use crate::stream::{emit, StreamEvent, StreamSender};
use stepgraph_checkpoint::{
    new_checkpoint_id, next_version, Channel, Checkpoint, CheckpointConfig, CheckpointMetadata,
    CheckpointSaver, CheckpointSource, WriteEntry,
};

/// Phase of the loop's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    RunningStep,
    CommittingWrites,
    CheckingTermination,
    Suspended,
    Completed,
    Failed,
}

/// How a run ended, short of an error.
#[derive(Debug)]
pub enum RunOutcome {
    /// No task is triggered; carries the final channel values
    Completed { values: HashMap<String, Value> },
    /// One or more tasks suspended; resume with values keyed by node name
    Suspended { interrupts: Vec<InterruptRecord> },
}

enum StepVerdict {
    Continue,
    Suspend(Vec<InterruptRecord>),
}

/// The execution engine for one graph on one thread.
pub struct SuperstepLoop {
    nodes: Vec<NodeSpec>,
    channels: HashMap<String, Box<dyn Channel>>,
    checkpoint: Checkpoint,
    step: i64,
    max_steps: usize,
    concurrency: Option<usize>,
    step_timeout: Option<Duration>,
    cache: Arc<TaskCache>,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    config: CheckpointConfig,
    stream: Option<StreamSender>,
    cancel: CancellationToken,
    resume: HashMap<String, Vec<Value>>,
    /// Pending writes recovered from the latest checkpoint, keyed by task
    /// id; consumed instead of re-executing the owning task
    restored_writes: HashMap<String, Vec<(String, Value)>>,
    state: LoopState,
}

impl SuperstepLoop {
    /// Build a loop from a graph definition, validating it first.
    pub fn new(spec: GraphSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            nodes: spec.nodes,
            channels: spec.channels,
            checkpoint: Checkpoint::new(),
            step: 0,
            max_steps: 25,
            concurrency: None,
            step_timeout: None,
            cache: Arc::new(TaskCache::new()),
            checkpointer: None,
            config: CheckpointConfig::new(),
            stream: None,
            cancel: CancellationToken::new(),
            resume: HashMap::new(),
            restored_writes: HashMap::new(),
            state: LoopState::Initializing,
        })
    }

    pub fn with_checkpointer(
        mut self,
        saver: Arc<dyn CheckpointSaver>,
        config: CheckpointConfig,
    ) -> Self {
        self.checkpointer = Some(saver);
        self.config = config;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_stream(mut self, sender: StreamSender) -> Self {
        self.stream = Some(sender);
        self
    }

    /// Caller-level cancellation; composes with per-step signals.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Current phase.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Current superstep number.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Snapshot of all currently readable channel values. Remains
    /// inspectable after a failed run; durability is not implied.
    pub fn values(&self) -> HashMap<String, Value> {
        self.channels
            .iter()
            .filter(|(_, ch)| ch.is_available())
            .filter_map(|(name, ch)| ch.get().ok().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Run until completion, suspension, or failure.
    ///
    /// `input` seeds the named channels before the first superstep of
    /// this call.
    pub async fn run(&mut self, input: Option<HashMap<String, Value>>) -> Result<RunOutcome> {
        self.state = LoopState::Initializing;
        if let Err(err) = self.initialize(input).await {
            self.state = LoopState::Failed;
            return Err(err);
        }

        let runner = TaskRunner::new(self.concurrency, self.step_timeout, self.cache.clone());
        let mut steps_run = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                self.state = LoopState::Failed;
                return Err(GraphError::Cancelled { task: "run".into() });
            }
            if steps_run >= self.max_steps {
                self.state = LoopState::Failed;
                return Err(GraphError::MaxStepsExceeded(self.max_steps));
            }

            self.state = LoopState::RunningStep;
            let tasks = prepare_tasks(&self.checkpoint, &self.nodes, &self.channels);
            if tasks.is_empty() {
                info!(step = self.step, "no tasks triggered, run complete");
                let values = self.values();
                for channel in self.channels.values_mut() {
                    if channel.is_ephemeral() {
                        channel.consume();
                    }
                }
                self.state = LoopState::Completed;
                return Ok(RunOutcome::Completed { values });
            }
            debug!(step = self.step, tasks = tasks.len(), "superstep starting");

            // tasks whose writes survived a previous partial step are
            // restored, everything else executes
            let mut restored: HashMap<String, Vec<(String, Value)>> = HashMap::new();
            let mut to_run = Vec::new();
            for task in &tasks {
                match self.restored_writes.remove(&task.id) {
                    Some(writes) => {
                        debug!(task = %task.name, "restoring writes from pending set");
                        restored.insert(task.id.clone(), writes);
                    }
                    None => to_run.push(task.clone()),
                }
            }

            let report = runner
                .run_step(to_run, &self.resume, self.step, &self.cancel)
                .await;

            self.state = LoopState::CommittingWrites;
            let verdict = match self.commit_step(&tasks, restored, report).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    self.state = LoopState::Failed;
                    return Err(err);
                }
            };

            self.state = LoopState::CheckingTermination;
            match verdict {
                StepVerdict::Continue => {
                    steps_run += 1;
                    self.resume.clear();
                }
                StepVerdict::Suspend(interrupts) => {
                    self.state = LoopState::Suspended;
                    return Ok(RunOutcome::Suspended { interrupts });
                }
            }
        }
    }

    /// Resume a suspended run with values for the interrupted node(s),
    /// ordered by interrupt ordinal.
    pub async fn resume(&mut self, resume: HashMap<String, Vec<Value>>) -> Result<RunOutcome> {
        self.resume.extend(resume);
        self.run(None).await
    }

    async fn initialize(&mut self, input: Option<HashMap<String, Value>>) -> Result<()> {
        let mut fresh = true;
        if let Some(saver) = self.checkpointer.clone() {
            if self.config.thread_id.is_some() {
                if let Some(tuple) = saver.get_tuple(&self.config).await? {
                    fresh = false;
                    debug!(checkpoint_id = %tuple.checkpoint.id, "resuming from checkpoint");
                    self.checkpoint = tuple.checkpoint;
                    self.step = tuple
                        .metadata
                        .as_ref()
                        .and_then(|m| m.step)
                        .map(|s| s + 1)
                        .unwrap_or(0);
                    for (name, channel) in self.channels.iter_mut() {
                        if let Some(snapshot) = self.checkpoint.channel_values.get(name) {
                            *channel = channel.restore(snapshot.clone())?;
                        }
                    }
                    self.restored_writes.clear();
                    for write in tuple.pending_writes {
                        if write.channel == INTERRUPT_CHANNEL {
                            continue;
                        }
                        self.restored_writes
                            .entry(write.task_id)
                            .or_default()
                            .push((write.channel, write.value));
                    }
                }
            }
        }

        if let Some(input) = input {
            self.seed_input(input, fresh).await?;
        }
        Ok(())
    }

    /// Apply caller input as a single write batch and, when starting a
    /// fresh persisted thread, record the input checkpoint.
    async fn seed_input(&mut self, input: HashMap<String, Value>, fresh: bool) -> Result<()> {
        let next = next_version(&self.checkpoint.channel_versions);
        let mut names: Vec<&String> = input.keys().collect();
        names.sort();
        for name in names {
            let value = input[name].clone();
            let channel = self.channels.get_mut(name.as_str()).ok_or_else(|| {
                GraphError::validation(format!("input targets unknown channel '{name}'"))
            })?;
            if channel.update(vec![WriteEntry::from(INPUT_WRITER, value)])? {
                self.checkpoint
                    .channel_versions
                    .insert(name.clone(), next.clone());
            }
        }

        if fresh && self.checkpointer.is_some() {
            self.snapshot_channels()?;
            self.checkpoint.id = new_checkpoint_id();
            self.checkpoint.ts = chrono::Utc::now();
            self.persist(CheckpointMetadata::for_step(
                self.step - 1,
                CheckpointSource::Input,
            ))
            .await?;
        }
        Ok(())
    }

    /// Fold one step's results into channels and checkpoint.
    ///
    /// Failure and timeout surface as `Err` after preserving completed
    /// sibling writes; interrupts suspend; otherwise the writes commit
    /// and a new checkpoint is persisted.
    async fn commit_step(
        &mut self,
        tasks: &[ExecutableTask],
        restored: HashMap<String, Vec<(String, Value)>>,
        report: StepReport,
    ) -> Result<StepVerdict> {
        let timed_out = report.timed_out;
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut interrupts: Vec<InterruptRecord> = Vec::new();
        let mut interrupted_tasks: Vec<(String, Vec<InterruptRecord>)> = Vec::new();
        let mut failure: Option<GraphError> = None;
        let mut cancelled_task: Option<String> = None;

        for result in report.results {
            match result.outcome {
                TaskOutcome::Success(output) => {
                    emit(
                        &self.stream,
                        StreamEvent::TaskResult {
                            step: self.step,
                            task: result.name.clone(),
                            ok: true,
                            error: None,
                        },
                    );
                    outputs.insert(result.task_id, output);
                }
                TaskOutcome::Failed(err) => {
                    emit(
                        &self.stream,
                        StreamEvent::TaskResult {
                            step: self.step,
                            task: result.name.clone(),
                            ok: false,
                            error: Some(err.to_string()),
                        },
                    );
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
                TaskOutcome::Cancelled => {
                    if cancelled_task.is_none() {
                        cancelled_task = Some(result.name.clone());
                    }
                }
                TaskOutcome::Interrupted(records) => {
                    emit(
                        &self.stream,
                        StreamEvent::Debug {
                            step: self.step,
                            name: "task_interrupted".into(),
                            payload: serde_json::to_value(&records)?,
                        },
                    );
                    interrupts.extend(records.clone());
                    interrupted_tasks.push((result.task_id, records));
                }
            }
        }

        // route successful outputs through declared writes; registration
        // order is preserved by walking the prepared task list
        let mut committed: Vec<CommittedTask> = Vec::new();
        let mut freshly_written: Vec<(String, Vec<(String, Value)>)> = Vec::new();
        for task in tasks {
            let writes = match restored.get(&task.id) {
                Some(writes) => writes.clone(),
                None => match outputs.get(&task.id) {
                    Some(output) => {
                        let routed =
                            route_writes(&task.name, &task.writes, output, &self.channels);
                        freshly_written.push((task.id.clone(), routed.clone()));
                        routed
                    }
                    None => continue,
                },
            };
            committed.push(CommittedTask {
                name: task.name.clone(),
                triggers: task.triggers.clone(),
                writes,
            });
        }

        if timed_out || failure.is_some() || cancelled_task.is_some() {
            // partial step: keep what finished, then surface the cause
            self.persist_pending(&freshly_written, &[]).await?;
            warn!(step = self.step, "superstep failed");
            if timed_out {
                return Err(GraphError::StepTimeout {
                    step: self.step,
                    duration_ms: self
                        .step_timeout
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                });
            }
            if let Some(err) = failure {
                return Err(err);
            }
            return Err(GraphError::Cancelled {
                task: cancelled_task.unwrap_or_default(),
            });
        }

        if !interrupts.is_empty() {
            // suspend without committing; sibling progress and interrupt
            // records attach to the current checkpoint as pending writes
            self.persist_pending(&freshly_written, &interrupted_tasks)
                .await?;
            for (task_id, writes) in freshly_written {
                self.restored_writes.insert(task_id, writes);
            }
            for (task_id, writes) in restored {
                self.restored_writes.insert(task_id, writes);
            }
            info!(
                step = self.step,
                interrupts = interrupts.len(),
                "superstep suspended"
            );
            return Ok(StepVerdict::Suspend(interrupts));
        }

        apply_writes(&mut self.checkpoint, &mut self.channels, &committed)?;
        for task in &committed {
            if !task.writes.is_empty() {
                emit(
                    &self.stream,
                    StreamEvent::Updates {
                        step: self.step,
                        task: task.name.clone(),
                        writes: task.writes.clone(),
                    },
                );
            }
        }

        self.snapshot_channels()?;
        self.checkpoint.id = new_checkpoint_id();
        self.checkpoint.ts = chrono::Utc::now();
        self.persist(CheckpointMetadata::for_step(self.step, CheckpointSource::Loop))
            .await?;
        emit(
            &self.stream,
            StreamEvent::Values {
                step: self.step,
                values: self.values(),
            },
        );
        self.step += 1;
        Ok(StepVerdict::Continue)
    }

    /// Attach writes and interrupt records of a partial step to the
    /// current checkpoint.
    async fn persist_pending(
        &self,
        successes: &[(String, Vec<(String, Value)>)],
        interrupted: &[(String, Vec<InterruptRecord>)],
    ) -> Result<()> {
        let saver = match &self.checkpointer {
            Some(saver) => saver,
            None => return Ok(()),
        };
        if self.config.thread_id.is_none() {
            return Ok(());
        }
        let config = self.current_checkpoint_config();
        for (task_id, writes) in successes {
            if writes.is_empty() {
                continue;
            }
            saver.put_writes(&config, writes.clone(), task_id).await?;
        }
        for (task_id, records) in interrupted {
            let mut writes = Vec::with_capacity(records.len());
            for record in records {
                writes.push((INTERRUPT_CHANNEL.to_string(), serde_json::to_value(record)?));
            }
            saver.put_writes(&config, writes, task_id).await?;
        }
        Ok(())
    }

    async fn persist(&mut self, metadata: CheckpointMetadata) -> Result<()> {
        if let Some(saver) = self.checkpointer.clone() {
            let stored = saver
                .put(
                    &self.config,
                    self.checkpoint.clone(),
                    metadata,
                    self.checkpoint.channel_versions.clone(),
                )
                .await?;
            emit(
                &self.stream,
                StreamEvent::Debug {
                    step: self.step,
                    name: "checkpoint_created".into(),
                    payload: serde_json::json!({
                        "checkpoint_id": stored.checkpoint_id,
                    }),
                },
            );
        }
        Ok(())
    }

    /// Refresh `checkpoint.channel_values` from live channels, dropping
    /// ephemeral ones.
    fn snapshot_channels(&mut self) -> Result<()> {
        for (name, channel) in &self.channels {
            match channel.checkpoint()? {
                Some(snapshot) => {
                    self.checkpoint
                        .channel_values
                        .insert(name.clone(), snapshot);
                }
                None => {
                    self.checkpoint.channel_values.remove(name);
                }
            }
        }
        Ok(())
    }

    /// Config addressing the currently loaded checkpoint.
    fn current_checkpoint_config(&self) -> CheckpointConfig {
        self.config
            .clone()
            .with_checkpoint_id(self.checkpoint.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{node_fn, NodeSpec};
    use serde_json::json;
    use stepgraph_checkpoint::LastValueChannel;

    fn echo_graph() -> GraphSpec {
        GraphSpec::new()
            .add_channel("input", Box::new(LastValueChannel::new("input")))
            .add_channel("output", Box::new(LastValueChannel::new("output")))
            .add_node(
                NodeSpec::new(
                    "echo",
                    node_fn(|input, _| Box::pin(async move { Ok(input) })),
                )
                .with_trigger("input")
                .writes_to("output"),
            )
    }

    #[tokio::test]
    async fn run_without_input_completes_immediately() {
        let mut engine = SuperstepLoop::new(echo_graph()).unwrap();
        let outcome = engine.run(None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(engine.state(), LoopState::Completed);
    }

    #[tokio::test]
    async fn single_step_echo() {
        let mut engine = SuperstepLoop::new(echo_graph()).unwrap();
        let outcome = engine
            .run(Some(HashMap::from([("input".to_string(), json!("hello"))])))
            .await
            .unwrap();
        match outcome {
            RunOutcome::Completed { values } => {
                assert_eq!(values.get("output"), Some(&json!("hello")));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(engine.step(), 1);
    }

    #[tokio::test]
    async fn invalid_graph_rejected_at_construction() {
        let spec = GraphSpec::new().add_node(
            NodeSpec::new(
                "orphan",
                node_fn(|input, _| Box::pin(async move { Ok(input) })),
            )
            .with_trigger("missing"),
        );
        assert!(matches!(
            SuperstepLoop::new(spec),
            Err(GraphError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn self_triggering_node_hits_max_steps() {
        let spec = GraphSpec::new()
            .add_channel("loop", Box::new(LastValueChannel::new("loop")))
            .add_node(
                NodeSpec::new(
                    "spinner",
                    node_fn(|input, _| {
                        Box::pin(async move {
                            Ok(json!(input.as_i64().unwrap_or(0) + 1))
                        })
                    }),
                )
                .with_trigger("loop")
                .writes_to("loop"),
            );
        let mut engine = SuperstepLoop::new(spec).unwrap().with_max_steps(5);
        let err = engine
            .run(Some(HashMap::from([("loop".to_string(), json!(0))])))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::MaxStepsExceeded(5)));
        assert_eq!(engine.state(), LoopState::Failed);
    }
}
