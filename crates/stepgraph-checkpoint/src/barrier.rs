//! Barrier channels
//!
//! A barrier buffers writes per logical source and hides them from readers
//! until a release condition holds. Until release, `get` returns the value
//! made visible by the previous release (or fails if there has never been
//! one), and `update` reports "unchanged" so the channel's version does not
//! move and downstream subscribers do not trigger.
//!
//! On release the accumulated contributions become visible as a single JSON
//! object mapping source name to contributed value, the pending buffer
//! clears, and `update` reports "changed" exactly once. Contributions may
//! arrive across several supersteps; pending state survives checkpointing.
//!
//! Two release conditions:
//! - [`NamedBarrierChannel`]: a fixed required set of source names; the
//!   barrier releases once every required source has contributed.
//! - [`DynamicBarrierChannel`]: a caller-supplied predicate over the
//!   accumulated contribution map.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channels::{Channel, WriteEntry};
use crate::error::{CheckpointError, Result};

/// Serialized barrier state: released value plus in-flight contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BarrierSnapshot {
    value: Option<Value>,
    pending: BTreeMap<String, Value>,
}

fn combined(pending: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        pending
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// Releases once every name in a fixed required set has written.
#[derive(Debug, Clone)]
pub struct NamedBarrierChannel {
    name: String,
    required: BTreeSet<String>,
    pending: BTreeMap<String, Value>,
    value: Option<Value>,
}

impl NamedBarrierChannel {
    pub fn new<I, S>(name: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            required: required.into_iter().map(Into::into).collect(),
            pending: BTreeMap::new(),
            value: None,
        }
    }

    fn ingest(&mut self, writes: Vec<WriteEntry>) -> Result<()> {
        for w in writes {
            let source = w.writer.ok_or_else(|| {
                CheckpointError::invalid_update(&self.name, "barrier writes require a named writer")
            })?;
            if !self.required.contains(&source) {
                return Err(CheckpointError::invalid_update(
                    &self.name,
                    format!("writer '{source}' is not part of the barrier set"),
                ));
            }
            // repeated contribution from one source replaces its pending value
            self.pending.insert(source, w.value);
        }
        Ok(())
    }
}

impl Channel for NamedBarrierChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel(self.name.clone()))
    }

    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool> {
        if writes.is_empty() {
            return Ok(false);
        }
        self.ingest(writes)?;
        let released = self
            .required
            .iter()
            .all(|name| self.pending.contains_key(name));
        if released {
            self.value = Some(combined(&self.pending));
            self.pending.clear();
        }
        Ok(released)
    }

    fn checkpoint(&self) -> Result<Option<Value>> {
        let snapshot = BarrierSnapshot {
            value: self.value.clone(),
            pending: self.pending.clone(),
        };
        Ok(Some(serde_json::to_value(snapshot)?))
    }

    fn restore(&self, snapshot: Value) -> Result<Box<dyn Channel>> {
        let snap: BarrierSnapshot = serde_json::from_value(snapshot)?;
        Ok(Box::new(Self {
            name: self.name.clone(),
            required: self.required.clone(),
            pending: snap.pending,
            value: snap.value,
        }))
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Release decision over the accumulated contribution map.
pub type BarrierPredicate = Arc<dyn Fn(&BTreeMap<String, Value>) -> bool + Send + Sync>;

/// Releases when a caller-supplied predicate over the contributions holds.
///
/// The predicate is not serializable; `restore` reuses the predicate of the
/// instance it is called on, so rehydration must go through a channel built
/// with the same graph definition.
#[derive(Clone)]
pub struct DynamicBarrierChannel {
    name: String,
    predicate: BarrierPredicate,
    pending: BTreeMap<String, Value>,
    value: Option<Value>,
}

impl DynamicBarrierChannel {
    pub fn new(name: impl Into<String>, predicate: BarrierPredicate) -> Self {
        Self {
            name: name.into(),
            predicate,
            pending: BTreeMap::new(),
            value: None,
        }
    }

    /// Release once at least `n` distinct sources have contributed.
    pub fn quorum(name: impl Into<String>, n: usize) -> Self {
        Self::new(name, Arc::new(move |pending| pending.len() >= n))
    }
}

impl fmt::Debug for DynamicBarrierChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicBarrierChannel")
            .field("name", &self.name)
            .field("pending", &self.pending)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl Channel for DynamicBarrierChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel(self.name.clone()))
    }

    fn update(&mut self, writes: Vec<WriteEntry>) -> Result<bool> {
        if writes.is_empty() {
            return Ok(false);
        }
        for w in writes {
            let source = w.writer.ok_or_else(|| {
                CheckpointError::invalid_update(&self.name, "barrier writes require a named writer")
            })?;
            self.pending.insert(source, w.value);
        }
        if (self.predicate)(&self.pending) {
            self.value = Some(combined(&self.pending));
            self.pending.clear();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn checkpoint(&self) -> Result<Option<Value>> {
        let snapshot = BarrierSnapshot {
            value: self.value.clone(),
            pending: self.pending.clone(),
        };
        Ok(Some(serde_json::to_value(snapshot)?))
    }

    fn restore(&self, snapshot: Value) -> Result<Box<dyn Channel>> {
        let snap: BarrierSnapshot = serde_json::from_value(snapshot)?;
        Ok(Box::new(Self {
            name: self.name.clone(),
            predicate: Arc::clone(&self.predicate),
            pending: snap.pending,
            value: snap.value,
        }))
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_barrier_holds_until_all_sources_write() {
        let mut ch = NamedBarrierChannel::new("gate", ["a", "b"]);
        let changed = ch
            .update(vec![WriteEntry::from("a", json!("from-a"))])
            .unwrap();
        assert!(!changed);
        assert!(matches!(
            ch.get().unwrap_err(),
            CheckpointError::EmptyChannel(_)
        ));

        let changed = ch
            .update(vec![WriteEntry::from("b", json!("from-b"))])
            .unwrap();
        assert!(changed);
        assert_eq!(
            ch.get().unwrap(),
            json!({"a": "from-a", "b": "from-b"})
        );
    }

    #[test]
    fn named_barrier_release_order_does_not_matter() {
        let mut ch = NamedBarrierChannel::new("gate", ["a", "b"]);
        ch.update(vec![WriteEntry::from("b", json!(2))]).unwrap();
        let changed = ch.update(vec![WriteEntry::from("a", json!(1))]).unwrap();
        assert!(changed);
        assert_eq!(ch.get().unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn named_barrier_releases_exactly_once_per_cycle() {
        let mut ch = NamedBarrierChannel::new("gate", ["a", "b"]);
        ch.update(vec![
            WriteEntry::from("a", json!(1)),
            WriteEntry::from("b", json!(2)),
        ])
        .unwrap();
        let first = ch.get().unwrap();

        // a lone contribution afterwards starts a new cycle without
        // disturbing the released value
        let changed = ch.update(vec![WriteEntry::from("a", json!(3))]).unwrap();
        assert!(!changed);
        assert_eq!(ch.get().unwrap(), first);
    }

    #[test]
    fn named_barrier_rejects_foreign_writer() {
        let mut ch = NamedBarrierChannel::new("gate", ["a", "b"]);
        let err = ch
            .update(vec![WriteEntry::from("intruder", json!(0))])
            .unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidUpdate { .. }));
    }

    #[test]
    fn named_barrier_pending_survives_checkpoint() {
        let mut ch = NamedBarrierChannel::new("gate", ["a", "b"]);
        ch.update(vec![WriteEntry::from("a", json!(1))]).unwrap();
        let snap = ch.checkpoint().unwrap().unwrap();

        let mut restored = ch.restore(snap).unwrap();
        let changed = restored
            .update(vec![WriteEntry::from("b", json!(2))])
            .unwrap();
        assert!(changed);
        assert_eq!(restored.get().unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn dynamic_barrier_quorum() {
        let mut ch = DynamicBarrierChannel::quorum("gate", 2);
        assert!(!ch.update(vec![WriteEntry::from("x", json!(1))]).unwrap());
        assert!(ch.update(vec![WriteEntry::from("y", json!(2))]).unwrap());
        assert_eq!(ch.get().unwrap(), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn dynamic_barrier_predicate_sees_contributions() {
        let mut ch = DynamicBarrierChannel::new(
            "gate",
            Arc::new(|pending| pending.values().any(|v| v == &json!("go"))),
        );
        assert!(!ch
            .update(vec![WriteEntry::from("a", json!("wait"))])
            .unwrap());
        assert!(ch.update(vec![WriteEntry::from("b", json!("go"))]).unwrap());
    }
}
