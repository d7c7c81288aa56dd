//! Trigger selection and write commit
//!
//! `prepare_tasks` decides which nodes run in the next superstep by
//! comparing each trigger channel's current version against the version
//! recorded when the node last ran. `apply_writes` is the commit phase:
//! it folds every finished task's writes into the channels in a fixed
//! deterministic order (task registration order, then write order within
//! a task) so non-commutative reducers produce the same result no matter
//! which task finished first in real time.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::engine::types::{ChannelWrite, ExecutableTask, NodeSpec};
use crate::error::{GraphError, Result};
use stepgraph_checkpoint::{
    next_version, null_version, Channel, Checkpoint, WriteEntry,
};

/// A finished task's routed writes, ready for commit. The caller supplies
/// these in node registration order.
#[derive(Debug, Clone)]
pub struct CommittedTask {
    pub name: String,
    pub triggers: Vec<String>,
    pub writes: Vec<(String, Value)>,
}

/// Compute the triggered task set for the next superstep, in node
/// registration order, each with a frozen input snapshot.
pub fn prepare_tasks(
    checkpoint: &Checkpoint,
    nodes: &[NodeSpec],
    channels: &HashMap<String, Box<dyn Channel>>,
) -> Vec<ExecutableTask> {
    let null = null_version(&checkpoint.channel_versions);
    let mut tasks = Vec::new();

    for node in nodes {
        let seen = checkpoint.versions_seen.get(&node.name);
        let triggered = node.triggers.iter().any(|trigger| {
            match checkpoint.channel_versions.get(trigger) {
                Some(current) => {
                    let last = seen
                        .and_then(|s| s.get(trigger))
                        .unwrap_or(&null);
                    current > last
                }
                // never written, nothing to react to
                None => false,
            }
        });
        if !triggered {
            continue;
        }

        let input = snapshot_input(node, channels);
        debug!(node = %node.name, "task triggered");
        tasks.push(ExecutableTask {
            id: format!("{}:{}", checkpoint.id, node.name),
            name: node.name.clone(),
            input,
            triggers: node.triggers.clone(),
            writes: node.writes.clone(),
            retry_policy: node.retry_policy.clone(),
            cache_policy: node.cache_policy.clone(),
            executor: node.executor.clone(),
        });
    }
    tasks
}

/// Frozen view of a node's readable channels: a single channel's value
/// directly, or an object keyed by channel name when there are several.
/// Unavailable channels are omitted.
fn snapshot_input(node: &NodeSpec, channels: &HashMap<String, Box<dyn Channel>>) -> Value {
    let reads = node.read_channels();
    if reads.len() == 1 {
        return channels
            .get(&reads[0])
            .filter(|ch| ch.is_available())
            .and_then(|ch| ch.get().ok())
            .unwrap_or(Value::Null);
    }
    let mut object = Map::new();
    for name in reads {
        if let Some(ch) = channels.get(name) {
            if ch.is_available() {
                if let Ok(value) = ch.get() {
                    object.insert(name.clone(), value);
                }
            }
        }
    }
    Value::Object(object)
}

/// Route a node's output value through its declared writes.
///
/// For each declared target the routed value is the output's field of the
/// same name, or the whole output when the node declares exactly one
/// write. The optional transform applies before the `only_if_changed`
/// comparison against the channel's current value.
pub fn route_writes(
    name: &str,
    writes: &[ChannelWrite],
    output: &Value,
    channels: &HashMap<String, Box<dyn Channel>>,
) -> Vec<(String, Value)> {
    let mut routed = Vec::new();
    for write in writes {
        let raw = match output.get(&write.channel) {
            Some(field) => field.clone(),
            None if writes.len() == 1 => output.clone(),
            None => continue,
        };
        let value = match &write.transform {
            Some(transform) => transform(raw),
            None => raw,
        };
        if write.only_if_changed {
            let current = channels.get(&write.channel).and_then(|ch| ch.get().ok());
            if current.as_ref() == Some(&value) {
                debug!(node = %name, channel = %write.channel, "write skipped, unchanged");
                continue;
            }
        }
        routed.push((write.channel.clone(), value));
    }
    routed
}

/// Commit one superstep's writes.
///
/// Records each task's observed trigger versions, resets consumed and
/// ephemeral channels, applies grouped writes in the order given, and
/// bumps versions for channels whose update reported a change. Returns
/// the sorted list of updated channel names.
pub fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut HashMap<String, Box<dyn Channel>>,
    tasks: &[CommittedTask],
) -> Result<Vec<String>> {
    // record what each task observed before any of this step's bumps
    for task in tasks {
        let seen = checkpoint
            .versions_seen
            .entry(task.name.clone())
            .or_default();
        for trigger in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(trigger) {
                seen.insert(trigger.clone(), version.clone());
            }
        }
    }

    let next = next_version(&checkpoint.channel_versions);

    // step-boundary reset: channels consumed by the tasks that just ran,
    // plus every ephemeral channel
    for (name, channel) in channels.iter_mut() {
        let consumed_by_task = tasks.iter().any(|t| t.triggers.iter().any(|c| c == name));
        if consumed_by_task || channel.is_ephemeral() {
            channel.consume();
        }
    }

    // group writes by channel, preserving task order then write order
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<WriteEntry>> = HashMap::new();
    for task in tasks {
        for (channel, value) in &task.writes {
            if channel.starts_with("__") && channel.ends_with("__") {
                continue;
            }
            if !grouped.contains_key(channel) {
                order.push(channel.clone());
            }
            grouped
                .entry(channel.clone())
                .or_default()
                .push(WriteEntry::from(task.name.clone(), value.clone()));
        }
    }

    let mut updated = Vec::new();
    for name in order {
        let entries = grouped.remove(&name).unwrap_or_default();
        let channel = channels.get_mut(&name).ok_or_else(|| {
            GraphError::validation(format!("write to unknown channel '{name}'"))
        })?;
        if channel.update(entries)? {
            checkpoint.channel_versions.insert(name.clone(), next.clone());
            updated.push(name);
        }
    }

    updated.sort();
    checkpoint.updated_channels = Some(updated.clone());
    debug!(updated = ?updated, "writes committed");
    Ok(updated)
}
