//! In-memory checkpoint saver
//!
//! Reference [`CheckpointSaver`] implementation backed by a process-local
//! map. Suitable for tests and single-process runs; state is lost when the
//! process exits. Checkpoint payloads are stored as bytes produced by the
//! configured [`SerializerProtocol`], so this saver exercises the same
//! encode/decode path an external backend would. The `RwLock` is held
//! across mutations, which serializes writes per thread as the trait
//! contract requires.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
    PendingWrite,
};
use crate::error::{CheckpointError, Result};
use crate::serializer::{JsonSerializer, SerializerProtocol};
use crate::traits::{CheckpointSaver, CheckpointStream};

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    ns: String,
    checkpoint_id: String,
    /// Serialized `Checkpoint`, decoded on read
    payload: Vec<u8>,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<PendingWrite>,
}

impl StoredCheckpoint {
    fn tuple<S: SerializerProtocol>(&self, serializer: &S) -> Result<CheckpointTuple> {
        Ok(CheckpointTuple {
            config: self.config.clone(),
            checkpoint: serializer.loads(&self.payload)?,
            metadata: Some(self.metadata.clone()),
            parent_config: self.parent_config.clone(),
            pending_writes: self.writes.clone(),
        })
    }
}

/// Process-local checkpoint storage keyed by thread id.
#[derive(Debug, Clone, Default)]
pub struct InMemorySaver<S: SerializerProtocol = JsonSerializer> {
    storage: Arc<RwLock<HashMap<String, Vec<StoredCheckpoint>>>>,
    serializer: S,
}

impl InMemorySaver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: SerializerProtocol> InMemorySaver<S> {
    /// Build a saver around a specific payload encoding.
    pub fn with_serializer(serializer: S) -> Self {
        Self {
            storage: Arc::default(),
            serializer,
        }
    }

    /// Number of threads with at least one checkpoint.
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of stored checkpoints across all threads.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    fn thread_id(config: &CheckpointConfig) -> Result<String> {
        config
            .thread_id
            .clone()
            .ok_or_else(|| CheckpointError::Invalid("config is missing thread_id".into()))
    }

    fn metadata_matches(metadata: &CheckpointMetadata, filter: &HashMap<String, Value>) -> bool {
        let as_value = match serde_json::to_value(metadata) {
            Ok(v) => v,
            Err(_) => return false,
        };
        filter
            .iter()
            .all(|(key, expected)| as_value.get(key) == Some(expected))
    }
}

#[async_trait]
impl<S> CheckpointSaver for InMemorySaver<S>
where
    S: SerializerProtocol + 'static,
{
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = Self::thread_id(config)?;
        let ns = config.namespace();
        let storage = self.storage.read().await;
        let entries = match storage.get(&thread_id) {
            Some(e) => e,
            None => return Ok(None),
        };

        let found = match &config.checkpoint_id {
            Some(id) => entries
                .iter()
                .find(|e| e.ns == ns && &e.checkpoint_id == id),
            // entries are stored in put order; ids are time-ordered, so
            // the last matching entry is the most recent
            None => entries.iter().rev().find(|e| e.ns == ns),
        };
        found.map(|e| e.tuple(&self.serializer)).transpose()
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let mut tuples: Vec<CheckpointTuple> = Vec::new();
        let before_id = before.and_then(|c| c.checkpoint_id.clone());
        let (thread_filter, ns_filter) = match config {
            Some(c) => (c.thread_id.clone(), c.checkpoint_ns.clone()),
            None => (None, None),
        };

        for (thread_id, entries) in storage.iter() {
            if let Some(t) = &thread_filter {
                if t != thread_id {
                    continue;
                }
            }
            for entry in entries.iter() {
                if let Some(ns) = &ns_filter {
                    if &entry.ns != ns {
                        continue;
                    }
                }
                if let Some(before_id) = &before_id {
                    if entry.checkpoint_id.as_str() >= before_id.as_str() {
                        continue;
                    }
                }
                if let Some(filter) = &filter {
                    if !Self::metadata_matches(&entry.metadata, filter) {
                        continue;
                    }
                }
                tuples.push(entry.tuple(&self.serializer)?);
            }
        }

        // newest first; ids sort chronologically
        tuples.sort_by(|a, b| b.checkpoint.id.cmp(&a.checkpoint.id));
        if let Some(limit) = limit {
            tuples.truncate(limit);
        }

        Ok(Box::pin(futures::stream::iter(tuples.into_iter().map(Ok))))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let thread_id = Self::thread_id(config)?;
        let ns = config.namespace().to_string();
        let payload = self.serializer.dumps(&checkpoint)?;

        let stored_config = CheckpointConfig::new()
            .with_thread_id(thread_id.clone())
            .with_namespace(ns.clone())
            .with_checkpoint_id(checkpoint.id.clone());

        let mut storage = self.storage.write().await;
        let entries = storage.entry(thread_id.clone()).or_default();
        let parent_config = entries
            .iter()
            .rev()
            .find(|e| e.ns == ns)
            .map(|e| e.config.clone());

        debug!(
            thread_id = %thread_id,
            checkpoint_id = %checkpoint.id,
            step = ?metadata.step,
            "storing checkpoint"
        );

        entries.push(StoredCheckpoint {
            ns,
            checkpoint_id: checkpoint.id,
            payload,
            metadata,
            config: stored_config.clone(),
            parent_config,
            writes: Vec::new(),
        });

        Ok(stored_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        let thread_id = Self::thread_id(config)?;
        let ns = config.namespace().to_string();
        let checkpoint_id = config.checkpoint_id.clone().ok_or_else(|| {
            CheckpointError::Invalid("put_writes requires a checkpoint_id".into())
        })?;

        let mut storage = self.storage.write().await;
        let entries = storage
            .get_mut(&thread_id)
            .ok_or_else(|| CheckpointError::NotFound(thread_id.clone()))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.ns == ns && e.checkpoint_id == checkpoint_id)
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        for (idx, (channel, value)) in writes.into_iter().enumerate() {
            let pending = PendingWrite {
                task_id: task_id.to_string(),
                idx,
                channel,
                value,
            };
            // upsert on (task, idx) so re-sends do not duplicate
            match entry
                .writes
                .iter_mut()
                .find(|w| w.task_id == pending.task_id && w.idx == pending.idx)
            {
                Some(existing) => *existing = pending,
                None => entry.writes.push(pending),
            }
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        if storage.remove(thread_id).is_some() {
            debug!(thread_id = %thread_id, "deleted thread");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ChannelVersion, CheckpointSource};
    use futures::TryStreamExt;
    use serde_json::json;

    fn config(thread: &str) -> CheckpointConfig {
        CheckpointConfig::new().with_thread_id(thread)
    }

    fn checkpoint_with_value(value: Value) -> Checkpoint {
        let mut cp = Checkpoint::new();
        cp.channel_values.insert("state".into(), value);
        cp.channel_versions
            .insert("state".into(), ChannelVersion::Int(1));
        cp
    }

    #[tokio::test]
    async fn put_then_get_tuple_roundtrip() {
        let saver = InMemorySaver::new();
        let cp = checkpoint_with_value(json!({"k": "v"}));
        let metadata = CheckpointMetadata::for_step(0, CheckpointSource::Loop);

        let stored = saver
            .put(&config("t1"), cp.clone(), metadata.clone(), Default::default())
            .await
            .unwrap();

        let tuple = saver.get_tuple(&stored).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, cp.id);
        assert_eq!(tuple.checkpoint.channel_values, cp.channel_values);
        assert_eq!(tuple.metadata.unwrap().step, Some(0));
    }

    #[tokio::test]
    async fn explicit_serializer_decodes_what_it_encoded() {
        let saver = InMemorySaver::with_serializer(JsonSerializer::new());
        let cp = checkpoint_with_value(json!({"nested": {"deep": [1, 2, 3]}}));
        let stored = saver
            .put(
                &config("t1"),
                cp.clone(),
                CheckpointMetadata::for_step(0, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&stored).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.channel_values, cp.channel_values);
        assert_eq!(tuple.checkpoint.channel_versions, cp.channel_versions);
        assert_eq!(tuple.checkpoint.ts, cp.ts);
    }

    #[tokio::test]
    async fn get_tuple_without_id_returns_latest() {
        let saver = InMemorySaver::new();
        for step in 0..3 {
            let cp = checkpoint_with_value(json!(step));
            saver
                .put(
                    &config("t1"),
                    cp,
                    CheckpointMetadata::for_step(step, CheckpointSource::Loop),
                    Default::default(),
                )
                .await
                .unwrap();
        }

        let tuple = saver.get_tuple(&config("t1")).await.unwrap().unwrap();
        assert_eq!(tuple.metadata.unwrap().step, Some(2));
    }

    #[tokio::test]
    async fn list_is_newest_first_with_limit_and_before() {
        let saver = InMemorySaver::new();
        let mut ids = Vec::new();
        for step in 0..4 {
            let cp = Checkpoint::new();
            ids.push(cp.id.clone());
            saver
                .put(
                    &config("t1"),
                    cp,
                    CheckpointMetadata::for_step(step, CheckpointSource::Loop),
                    Default::default(),
                )
                .await
                .unwrap();
        }

        let all: Vec<_> = saver
            .list(Some(&config("t1")), None, None, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let listed: Vec<_> = all.iter().map(|t| t.checkpoint.id.clone()).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let limited: Vec<_> = saver
            .list(Some(&config("t1")), None, None, Some(2))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].checkpoint.id, ids[3]);

        let before = CheckpointConfig::new().with_checkpoint_id(ids[2].clone());
        let earlier: Vec<_> = saver
            .list(Some(&config("t1")), None, Some(&before), None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(earlier.len(), 2);
        assert!(earlier.iter().all(|t| t.checkpoint.id < ids[2]));
    }

    #[tokio::test]
    async fn list_filters_on_metadata() {
        let saver = InMemorySaver::new();
        saver
            .put(
                &config("t1"),
                Checkpoint::new(),
                CheckpointMetadata::for_step(-1, CheckpointSource::Input),
                Default::default(),
            )
            .await
            .unwrap();
        saver
            .put(
                &config("t1"),
                Checkpoint::new(),
                CheckpointMetadata::for_step(0, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();

        let mut filter = HashMap::new();
        filter.insert("source".to_string(), json!("input"));
        let found: Vec<_> = saver
            .list(Some(&config("t1")), Some(filter), None, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.as_ref().unwrap().step, Some(-1));
    }

    #[tokio::test]
    async fn put_writes_is_idempotent_per_task_and_index() {
        let saver = InMemorySaver::new();
        let stored = saver
            .put(
                &config("t1"),
                Checkpoint::new(),
                CheckpointMetadata::for_step(0, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();

        let writes = vec![("state".to_string(), json!(1)), ("log".to_string(), json!("a"))];
        saver
            .put_writes(&stored, writes.clone(), "task-1")
            .await
            .unwrap();
        saver.put_writes(&stored, writes, "task-1").await.unwrap();

        let tuple = saver.get_tuple(&stored).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 2);
        assert_eq!(tuple.pending_writes[0].task_id, "task-1");
        assert_eq!(tuple.pending_writes[0].idx, 0);
    }

    #[tokio::test]
    async fn delete_thread_removes_chain_and_writes() {
        let saver = InMemorySaver::new();
        let stored = saver
            .put(
                &config("t1"),
                Checkpoint::new(),
                CheckpointMetadata::for_step(0, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();
        saver
            .put_writes(&stored, vec![("state".into(), json!(1))], "task-1")
            .await
            .unwrap();

        saver.delete_thread("t1").await.unwrap();
        assert!(saver.get_tuple(&config("t1")).await.unwrap().is_none());
        assert_eq!(saver.thread_count().await, 0);
    }

    #[tokio::test]
    async fn namespaces_are_isolated_within_a_thread() {
        let saver = InMemorySaver::new();
        let root = config("t1");
        let sub = config("t1").with_namespace("child");

        saver
            .put(
                &root,
                Checkpoint::new(),
                CheckpointMetadata::for_step(0, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();
        saver
            .put(
                &sub,
                Checkpoint::new(),
                CheckpointMetadata::for_step(5, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();

        let root_latest = saver.get_tuple(&root).await.unwrap().unwrap();
        assert_eq!(root_latest.metadata.unwrap().step, Some(0));
        let sub_latest = saver.get_tuple(&sub).await.unwrap().unwrap();
        assert_eq!(sub_latest.metadata.unwrap().step, Some(5));
    }

    #[tokio::test]
    async fn parent_config_links_the_chain() {
        let saver = InMemorySaver::new();
        let first = saver
            .put(
                &config("t1"),
                Checkpoint::new(),
                CheckpointMetadata::for_step(0, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();
        let second = saver
            .put(
                &config("t1"),
                Checkpoint::new(),
                CheckpointMetadata::for_step(1, CheckpointSource::Loop),
                Default::default(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&second).await.unwrap().unwrap();
        assert_eq!(tuple.parent_config.unwrap().checkpoint_id, first.checkpoint_id);
    }
}
