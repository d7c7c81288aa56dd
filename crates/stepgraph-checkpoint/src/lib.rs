//! # stepgraph-checkpoint
//!
//! State and persistence layer for the stepgraph runtime: the channel
//! variants nodes communicate through, the checkpoint data model produced
//! after every superstep, and the [`CheckpointSaver`] trait storage
//! adapters implement.
//!
//! The crate is deliberately free of execution logic; the superstep loop
//! lives in `stepgraph-core` and drives everything here through the
//! [`Channel`] and [`CheckpointSaver`] contracts.
//!
//! ## Modules
//!
//! - [`channels`]: last-value, topic, aggregate, and ephemeral channels
//! - [`barrier`]: named and dynamic barrier channels
//! - [`checkpoint`]: checkpoint/metadata/config/version types
//! - [`traits`]: the `CheckpointSaver` persistence contract
//! - [`memory`]: in-memory saver for tests and single-process runs
//! - [`serializer`]: payload encoding strategies

pub mod barrier;
pub mod channels;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use barrier::{BarrierPredicate, DynamicBarrierChannel, NamedBarrierChannel};
pub use channels::{
    BinaryOperatorChannel, Channel, EphemeralValueChannel, LastValueChannel, ReducerFn,
    TopicChannel, WriteEntry,
};
pub use checkpoint::{
    new_checkpoint_id, next_version, null_version, ChannelVersion, ChannelVersions, Checkpoint,
    CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemorySaver;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
