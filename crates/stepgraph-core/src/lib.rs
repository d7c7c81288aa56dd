//! Bulk-synchronous superstep execution for directed computation graphs.
//!
//! A graph is a set of named channels plus nodes that trigger on channel
//! version bumps. Execution proceeds in supersteps: every triggered node
//! runs concurrently against a frozen channel snapshot, then all writes
//! commit together in deterministic order before the next step is
//! planned. Between steps the engine can checkpoint through any
//! [`stepgraph_checkpoint::CheckpointSaver`], which enables resuming a
//! thread, time travel across checkpoints, and a human-in-the-loop
//! interrupt/resume protocol.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use serde_json::json;
//! use stepgraph_checkpoint::LastValueChannel;
//! use stepgraph_core::engine::{node_fn, GraphSpec, NodeSpec, SuperstepLoop};
//!
//! # async fn demo() -> stepgraph_core::error::Result<()> {
//! let spec = GraphSpec::new()
//!     .add_channel("question", Box::new(LastValueChannel::new("question")))
//!     .add_channel("answer", Box::new(LastValueChannel::new("answer")))
//!     .add_node(
//!         NodeSpec::new("answerer", node_fn(|input, _| {
//!             Box::pin(async move { Ok(json!(format!("answering: {input}"))) })
//!         }))
//!         .with_trigger("question")
//!         .writes_to("answer"),
//!     );
//!
//! let mut engine = SuperstepLoop::new(spec)?;
//! let outcome = engine
//!     .run(Some(HashMap::from([("question".to_string(), json!("why?"))])))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod retry;
pub mod stream;

pub use cache::{CachePolicy, TaskCache};
pub use engine::{GraphSpec, LoopState, NodeSpec, RunOutcome, SuperstepLoop};
pub use error::{GraphError, Result};
pub use interrupt::{InterruptRecord, TaskContext};
pub use retry::RetryPolicy;
pub use stream::{stream_channel, StreamEvent, StreamSender};
