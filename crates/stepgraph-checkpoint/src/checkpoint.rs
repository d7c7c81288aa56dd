//! Checkpoint data model
//!
//! A checkpoint is an immutable snapshot of every non-ephemeral channel's
//! value and version after a committed superstep, plus the bookkeeping the
//! engine needs to decide which tasks trigger next (`versions_seen`).
//! Checkpoint ids are UUID v7 strings: globally unique and time-ordered, so
//! sorting ids lexicographically sorts checkpoints chronologically.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Monotonically increasing channel version.
///
/// A graph uses one variant consistently; comparisons across variants are
/// undefined (`partial_cmp` returns `None`) except between the numeric
/// variants, which compare numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    String(String),
}

impl ChannelVersion {
    /// The next version after this one.
    pub fn next(&self) -> Self {
        match self {
            Self::Int(v) => Self::Int(v + 1),
            Self::Float(v) => Self::Float(v + 1.0),
            // v7 uuids are time-ordered, so fresh ones sort after old ones
            Self::String(_) => Self::String(Uuid::now_v7().to_string()),
        }
    }

    /// The implicit version of a channel never written, typed to match
    /// this version so ordering comparisons stay well-defined.
    pub fn null_of(&self) -> Self {
        match self {
            Self::Int(_) => Self::Int(0),
            Self::Float(_) => Self::Float(0.0),
            Self::String(_) => Self::String(String::new()),
        }
    }
}

impl PartialEq for ChannelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.partial_cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Per-channel version map.
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// The null version inferred from any known version in the map
/// (`Int(0)` when the map is empty).
pub fn null_version(versions: &ChannelVersions) -> ChannelVersion {
    versions
        .values()
        .next()
        .map(ChannelVersion::null_of)
        .unwrap_or(ChannelVersion::Int(0))
}

/// The next version to assign after the given map's maximum
/// (`Int(1)` when the map is empty).
pub fn next_version(versions: &ChannelVersions) -> ChannelVersion {
    let mut max: Option<&ChannelVersion> = None;
    for v in versions.values() {
        match max {
            None => max = Some(v),
            Some(m) => {
                if v.partial_cmp(m) == Some(Ordering::Greater) {
                    max = Some(v);
                }
            }
        }
    }
    match max {
        Some(m) => m.next(),
        None => ChannelVersion::Int(1),
    }
}

/// Generate a fresh time-ordered checkpoint id.
pub fn new_checkpoint_id() -> String {
    Uuid::now_v7().to_string()
}

/// Snapshot of graph state after a committed superstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Snapshot format version
    pub v: i32,
    /// Time-ordered, globally unique id
    pub id: String,
    /// Creation timestamp
    pub ts: DateTime<Utc>,
    /// Values of non-ephemeral channels, keyed by channel name
    pub channel_values: HashMap<String, Value>,
    /// Current version of every channel ever written
    pub channel_versions: ChannelVersions,
    /// Per-task map of channel versions observed at the task's last run,
    /// the basis of trigger detection
    pub versions_seen: HashMap<String, ChannelVersions>,
    /// Channels mutated by the superstep that produced this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self {
            v: 1,
            id: new_checkpoint_id(),
            ts: Utc::now(),
            channel_values: HashMap::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            updated_channels: None,
        }
    }

    /// Channels whose version differs between `self` and `prior`.
    pub fn diff_channels(&self, prior: &Checkpoint) -> Vec<String> {
        let mut out: Vec<String> = self
            .channel_versions
            .iter()
            .filter(|(name, version)| {
                prior
                    .channel_versions
                    .get(*name)
                    .map(|p| *version != p)
                    .unwrap_or(true)
            })
            .map(|(name, _)| name.clone())
            .collect();
        out.sort();
        out
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// What produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Seeding of input channels before the first superstep
    Input,
    /// A committed superstep
    Loop,
    /// An out-of-band state update
    Update,
    /// A fork of an existing thread
    Fork,
}

/// Metadata stored alongside a checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,
    /// Superstep number; -1 for the input checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    /// Map of parent namespace to checkpoint id, for nested graphs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointMetadata {
    pub fn for_step(step: i64, source: CheckpointSource) -> Self {
        Self {
            source: Some(source),
            step: Some(step),
            parents: None,
            extra: HashMap::new(),
        }
    }
}

/// Addressing for checkpoint storage: thread, namespace, and optionally a
/// specific checkpoint id (omitted means "latest").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(ns.into());
        self
    }

    pub fn with_checkpoint_id(mut self, id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(id.into());
        self
    }

    /// Namespace, defaulting to the root (empty) namespace.
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }
}

/// A write persisted ahead of the checkpoint that will eventually absorb
/// it: either a contribution to an unreleased barrier, or output of a task
/// whose sibling failed before commit. `(task_id, idx)` is the idempotence
/// key within a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub idx: usize,
    pub channel: String,
    pub value: Value,
}

/// Everything stored about one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: Option<CheckpointMetadata>,
    pub parent_config: Option<CheckpointConfig>,
    pub pending_writes: Vec<PendingWrite>,
}
