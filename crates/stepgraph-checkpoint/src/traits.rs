//! Checkpoint persistence trait
//!
//! [`CheckpointSaver`] is the contract the superstep loop drives all
//! durability through. Implementations are storage adapters; the in-memory
//! one lives in [`crate::memory`], external backends (SQL, document stores,
//! embedded files) implement the same trait out of tree.
//!
//! # Contract
//!
//! - A **thread** is a logical run lineage identified by `thread_id`; it
//!   owns a chain of checkpoints linked through `parent_config`. Nested
//!   subgraphs store their checkpoints under distinct `checkpoint_ns`
//!   namespaces within the same thread.
//! - `put` is called exactly once per committed superstep. Backends must
//!   serialize writes per thread: at most one in-flight checkpoint write
//!   per thread at a time. Runs on distinct threads are independent.
//! - `put_writes` is an idempotent upsert keyed by
//!   `(thread, namespace, checkpoint, task, write index)`. It persists
//!   task output that is not yet folded into a checkpoint's values, e.g. a
//!   contribution to a barrier that has not released, or the writes of a
//!   task whose sibling failed before the step committed.
//! - `list` returns tuples strictly newest-first. Checkpoint ids are
//!   time-ordered, so backends may sort by id alone.
//!
//! Errors are surfaced to the caller as-is; the loop performs no internal
//! retry around persistence.
//!
//! # Example
//!
//! ```rust
//! use stepgraph_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
//!     CheckpointSource, InMemorySaver,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stepgraph_checkpoint::Result<()> {
//! let saver = InMemorySaver::new();
//! let config = CheckpointConfig::new().with_thread_id("thread-1");
//!
//! let checkpoint = Checkpoint::new();
//! let metadata = CheckpointMetadata::for_step(-1, CheckpointSource::Input);
//! let stored = saver
//!     .put(&config, checkpoint, metadata, Default::default())
//!     .await?;
//!
//! let tuple = saver.get_tuple(&stored).await?.unwrap();
//! assert_eq!(tuple.config.checkpoint_id, stored.checkpoint_id);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
};
use crate::error::Result;

/// Stream of checkpoint tuples, newest first.
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send>>;

/// Persistence contract consumed by the superstep loop.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch the tuple addressed by `config`: a specific checkpoint when
    /// `checkpoint_id` is set, otherwise the most recent one for the
    /// thread and namespace. `None` if nothing matches.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints newest-first.
    ///
    /// `config` scopes to a thread (and namespace if set); `filter`
    /// matches metadata fields exactly; `before` excludes checkpoints at
    /// or after the given id; `limit` caps the result count.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Persist a new checkpoint, returning a config addressing it.
    /// Called exactly once per committed superstep.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Persist a task's writes against an existing checkpoint. Idempotent:
    /// re-sending the same `(task_id, index)` pair overwrites rather than
    /// duplicates.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()>;

    /// Remove every checkpoint and pending write owned by the thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Convenience wrapper returning just the checkpoint.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|t| t.checkpoint))
    }
}
