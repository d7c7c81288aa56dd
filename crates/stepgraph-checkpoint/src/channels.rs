//! Channel abstractions for graph state
//!
//! Channels are the only way nodes exchange state. Each channel is a named
//! cell with a reducer policy deciding how a superstep's writes fold into
//! the stored value:
//!
//! - [`LastValueChannel`]: replace on write; at most one writer per
//!   superstep unless explicitly marked multi-writer
//! - [`TopicChannel`]: accumulate writes into an ordered sequence,
//!   optionally cleared when consumed
//! - [`BinaryOperatorChannel`]: fold writes into the current value with an
//!   associative operator
//! - [`EphemeralValueChannel`]: last-value semantics, excluded from
//!   checkpoints and reset at every superstep boundary
//!
//! Barrier variants live in [`crate::barrier`]. The set of variants is
//! closed on purpose: the commit phase reasons exhaustively about reducer
//! semantics, so channels are selected at graph construction rather than
//! subclassed.
//!
//! All updates arrive through the engine's commit phase as batches of
//! [`WriteEntry`] values carrying the writing task's name. Tasks never
//! touch channel storage directly.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CheckpointError, Result};

/// A single write destined for a channel, tagged with the writer that
/// produced it. Writer identity drives single-writer enforcement and
/// barrier contribution tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    /// Name of the task (or `None` for anonymous/system writes)
    pub writer: Option<String>,
    /// The written value
    pub value: Value,
}

impl WriteEntry {
    /// An anonymous write.
    pub fn new(value: Value) -> Self {
        Self {
            writer: None,
            value,
        }
    }

    /// A write attributed to a named task.
    pub fn from(writer: impl Into<String>, value: Value) -> Self {
        Self {
            writer: Some(writer.into()),
            value,
        }
    }
}

/// State cell mediating all inter-task communication.
///
/// `update` receives one superstep's writes for this channel as a single
/// batch and returns whether the observable value changed; the engine bumps
/// the channel's version exactly when it does. `restore` rehydrates a fresh
/// instance from a snapshot produced by `checkpoint` and never mutates the
/// receiver.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Current value. Fails with [`CheckpointError::EmptyChannel`] if the
    /// channel was never written and has no default.
    fn get(&self) -> Result<Value>;

    /// Apply one superstep's writes. Returns `true` iff the observable
    /// value changed.
    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool>;

    /// Serialized state for persistence, or `None` if this channel is
    /// excluded from checkpoints.
    fn checkpoint(&self) -> Result<Option<Value>>;

    /// Build a fresh channel of the same variant from a snapshot.
    fn restore(&self, snapshot: Value) -> Result<Box<dyn Channel>>;

    /// Whether a read would currently succeed.
    fn is_available(&self) -> bool;

    /// Ephemeral channels are dropped from checkpoints and reset every
    /// superstep.
    fn is_ephemeral(&self) -> bool {
        false
    }

    /// Step-boundary hook invoked after a channel's subscribers ran.
    /// Returns `true` if internal state changed.
    fn consume(&mut self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Count of distinct writer names in a batch; anonymous writes each count
/// as their own writer.
fn distinct_writers(writes: &[WriteEntry]) -> usize {
    let mut named: Vec<&str> = Vec::new();
    let mut anonymous = 0usize;
    for w in writes {
        match &w.writer {
            Some(name) => {
                if !named.contains(&name.as_str()) {
                    named.push(name);
                }
            }
            None => anonymous += 1,
        }
    }
    named.len() + anonymous
}

/// Stores the most recent value written.
///
/// Rejects a superstep batch containing writes from more than one distinct
/// writer unless constructed with [`LastValueChannel::multi_writer`]. A
/// single writer may still pass several values in one batch; the last wins.
#[derive(Debug, Clone)]
pub struct LastValueChannel {
    name: String,
    value: Option<Value>,
    multi_writer: bool,
}

impl LastValueChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            multi_writer: false,
        }
    }

    /// Permit writes from several tasks in the same superstep; the last
    /// write in commit order wins.
    pub fn multi_writer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            multi_writer: true,
        }
    }

    /// Start from an initial value.
    pub fn with_default(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
            multi_writer: false,
        }
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel(self.name.clone()))
    }

    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool> {
        if writes.is_empty() {
            return Ok(false);
        }
        if !self.multi_writer && distinct_writers(&writes) > 1 {
            return Err(CheckpointError::invalid_update(
                &self.name,
                "multiple writers in one superstep on a single-writer channel",
            ));
        }
        // writes arrive in commit order; the last one is authoritative
        if let Some(last) = writes.into_iter().last() {
            self.value = Some(last.value);
        }
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<Value>> {
        Ok(self.value.clone())
    }

    fn restore(&self, snapshot: Value) -> Result<Box<dyn Channel>> {
        Ok(Box::new(Self {
            name: self.name.clone(),
            value: Some(snapshot),
            multi_writer: self.multi_writer,
        }))
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Accumulates every value written since the last consumption, in commit
/// order. `get` returns the accumulated JSON array.
#[derive(Debug, Clone)]
pub struct TopicChannel {
    name: String,
    values: Vec<Value>,
    clear_on_consume: bool,
}

impl TopicChannel {
    /// Accumulate indefinitely.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            clear_on_consume: false,
        }
    }

    /// Clear the accumulated sequence each time subscribers consume it.
    pub fn consuming(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            clear_on_consume: true,
        }
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool> {
        if writes.is_empty() {
            return Ok(false);
        }
        for w in writes {
            // a task may hand over a batch of messages at once
            match w.value {
                Value::Array(items) => self.values.extend(items),
                other => self.values.push(other),
            }
        }
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<Value>> {
        Ok(Some(Value::Array(self.values.clone())))
    }

    fn restore(&self, snapshot: Value) -> Result<Box<dyn Channel>> {
        let values = match snapshot {
            Value::Array(items) => items,
            other => {
                return Err(CheckpointError::Invalid(format!(
                    "topic channel '{}' snapshot must be an array, got {}",
                    self.name, other
                )))
            }
        };
        Ok(Box::new(Self {
            name: self.name.clone(),
            values,
            clear_on_consume: self.clear_on_consume,
        }))
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn consume(&mut self) -> bool {
        if self.clear_on_consume && !self.values.is_empty() {
            self.values.clear();
            true
        } else {
            false
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Associative fold applied to incoming writes.
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Folds each incoming value into the current one with an associative
/// binary operator. Associativity keeps the result well-defined under the
/// engine's deterministic commit order.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    name: String,
    value: Option<Value>,
    initial: Option<Value>,
    operator: ReducerFn,
}

impl BinaryOperatorChannel {
    pub fn new(name: impl Into<String>, initial: Option<Value>, operator: ReducerFn) -> Self {
        Self {
            name: name.into(),
            value: initial.clone(),
            initial,
            operator,
        }
    }

    /// Numeric sum starting from zero. Non-numeric writes are ignored by
    /// the fold.
    pub fn sum(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Some(Value::from(0)),
            Arc::new(|acc, v| {
                let a = acc.as_f64().unwrap_or(0.0);
                let b = v.as_f64().unwrap_or(0.0);
                let total = a + b;
                if total.fract() == 0.0 && total.abs() < i64::MAX as f64 {
                    Value::from(total as i64)
                } else {
                    Value::from(total)
                }
            }),
        )
    }

    /// List concatenation starting from the empty array.
    pub fn append(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Some(Value::Array(Vec::new())),
            Arc::new(|acc, v| {
                let mut items = match acc {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                match v {
                    Value::Array(more) => items.extend(more),
                    other => items.push(other),
                }
                Value::Array(items)
            }),
        )
    }
}

impl fmt::Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel(self.name.clone()))
    }

    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool> {
        if writes.is_empty() {
            return Ok(false);
        }
        let mut acc = match self.value.take() {
            Some(v) => v,
            None => {
                let mut iter = writes.into_iter();
                let first = match iter.next() {
                    Some(w) => w.value,
                    None => return Ok(false),
                };
                let folded = iter.fold(first, |a, w| (self.operator)(a, w.value));
                self.value = Some(folded);
                return Ok(true);
            }
        };
        for w in writes {
            acc = (self.operator)(acc, w.value);
        }
        self.value = Some(acc);
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<Value>> {
        Ok(self.value.clone())
    }

    fn restore(&self, snapshot: Value) -> Result<Box<dyn Channel>> {
        Ok(Box::new(Self {
            name: self.name.clone(),
            value: Some(snapshot),
            initial: self.initial.clone(),
            operator: Arc::clone(&self.operator),
        }))
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Last-value semantics scoped to a single superstep: the value vanishes at
/// the next step boundary and never reaches a checkpoint.
#[derive(Debug, Clone)]
pub struct EphemeralValueChannel {
    name: String,
    value: Option<Value>,
    multi_writer: bool,
}

impl EphemeralValueChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            multi_writer: false,
        }
    }

    pub fn multi_writer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            multi_writer: true,
        }
    }
}

impl Channel for EphemeralValueChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel(self.name.clone()))
    }

    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool> {
        if writes.is_empty() {
            return Ok(false);
        }
        if !self.multi_writer && distinct_writers(&writes) > 1 {
            return Err(CheckpointError::invalid_update(
                &self.name,
                "multiple writers in one superstep on a single-writer channel",
            ));
        }
        if let Some(last) = writes.into_iter().last() {
            self.value = Some(last.value);
        }
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    fn restore(&self, _snapshot: Value) -> Result<Box<dyn Channel>> {
        // ephemeral state is never persisted; rehydration starts empty
        Ok(Box::new(Self {
            name: self.name.clone(),
            value: None,
            multi_writer: self.multi_writer,
        }))
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn is_ephemeral(&self) -> bool {
        true
    }

    fn consume(&mut self) -> bool {
        self.value.take().is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}
