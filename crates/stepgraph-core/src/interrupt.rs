//! Suspension and resume primitives
//!
//! A task suspends by calling [`TaskContext::interrupt`] with a payload.
//! On a fresh execution the call records an [`InterruptRecord`] and aborts
//! the task body through the `?` operator; the loop then halts the step
//! and returns the records to the caller. On a resumed execution the loop
//! re-invokes the task from the top with the same frozen input, and each
//! interrupt call consults the ordered resume values by **ordinal**: the
//! 0-based count of interrupt calls already made during this execution.
//! A value at the current ordinal is returned immediately; a missing value
//! raises the suspension signal again.
//!
//! # Task-author contract
//!
//! Code before an unresolved suspension point re-executes on every resume
//! attempt. Task bodies must therefore be deterministic and idempotent up
//! to each interrupt call: same frozen input, same sequence of interrupt
//! ordinals, no observable side effects that cannot be safely repeated.
//! Expensive pre-suspension work can be memoized via a task cache policy
//! keyed on the task's input.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, Result};

/// A single suspension raised by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRecord {
    /// Position of this interrupt call within its task, 0-based
    pub ordinal: usize,
    /// Payload surfaced to the caller
    pub value: Value,
    /// Whether the run can be resumed past this interrupt
    pub resumable: bool,
    /// Task path, including ancestry through nested subgraphs
    pub ns: Vec<String>,
}

impl InterruptRecord {
    pub fn new(ordinal: usize, value: Value, ns: Vec<String>) -> Self {
        Self {
            ordinal,
            value,
            resumable: true,
            ns,
        }
    }
}

/// Per-execution context handed to every node invocation.
///
/// A fresh context is built for each attempt, resetting the interrupt
/// ordinal counter so replays observe the same ordinal sequence.
#[derive(Debug)]
pub struct TaskContext {
    /// Stable task id, `{checkpoint_id}:{node}`
    pub task_id: String,
    /// Node name
    pub node: String,
    /// Superstep number
    pub step: i64,
    /// Attempt number, 1-based
    pub attempt: usize,
    ns: Vec<String>,
    cancel: CancellationToken,
    resume: Vec<Value>,
    calls: AtomicUsize,
    raised: Mutex<Vec<InterruptRecord>>,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        node: impl Into<String>,
        step: i64,
        attempt: usize,
        cancel: CancellationToken,
        resume: Vec<Value>,
    ) -> Self {
        let node = node.into();
        Self {
            task_id: task_id.into(),
            ns: vec![node.clone()],
            node,
            step,
            attempt,
            cancel,
            resume,
            calls: AtomicUsize::new(0),
            raised: Mutex::new(Vec::new()),
        }
    }

    /// Prefix the task path with a parent namespace (nested subgraphs).
    pub fn with_parent_ns(mut self, parent: impl Into<String>) -> Self {
        self.ns.insert(0, parent.into());
        self
    }

    /// Suspend with a payload, or continue with a previously supplied
    /// resume value.
    ///
    /// Returns the resume value at this call's ordinal if the caller has
    /// supplied one; otherwise records the interrupt and raises
    /// [`GraphError::Interrupted`], which aborts the task body via `?`.
    pub fn interrupt(&self, value: Value) -> Result<Value> {
        let ordinal = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(resume) = self.resume.get(ordinal) {
            return Ok(resume.clone());
        }
        let record = InterruptRecord::new(ordinal, value, self.ns.clone());
        if let Ok(mut raised) = self.raised.lock() {
            raised.push(record.clone());
        }
        Err(GraphError::Interrupted(vec![record]))
    }

    /// Interrupts raised during this execution, in call order.
    pub fn raised_interrupts(&self) -> Vec<InterruptRecord> {
        self.raised.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Whether a governing cancellation signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for cooperative cancellation inside long-running bodies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
