//! Streaming event surface
//!
//! The loop can emit a channel of [`StreamEvent`]s while it runs; an
//! external transport decides how (and whether) to relay them. The loop
//! never blocks on the receiver: events go through an unbounded sender
//! and send failures are ignored, so a dropped receiver simply stops the
//! stream.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// One observable moment of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Full channel snapshot after a committed superstep
    Values {
        step: i64,
        values: HashMap<String, Value>,
    },
    /// One task's committed writes
    Updates {
        step: i64,
        task: String,
        writes: Vec<(String, Value)>,
    },
    /// Terminal outcome of one task
    TaskResult {
        step: i64,
        task: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Raw engine event, for debugging transports
    Debug {
        step: i64,
        name: String,
        payload: Value,
    },
}

/// Sending half handed to the loop.
pub type StreamSender = mpsc::UnboundedSender<StreamEvent>;

/// Create a stream pair; hand the sender to the loop, read the receiver.
pub fn stream_channel() -> (StreamSender, mpsc::UnboundedReceiver<StreamEvent>) {
    mpsc::unbounded_channel()
}

/// Fire-and-forget emission.
pub(crate) fn emit(sender: &Option<StreamSender>, event: StreamEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_tags() {
        let event = StreamEvent::TaskResult {
            step: 2,
            task: "worker".into(),
            ok: false,
            error: Some("boom".into()),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], json!("task_result"));
        assert_eq!(v["task"], json!("worker"));
    }

    #[tokio::test]
    async fn emit_ignores_dropped_receiver() {
        let (tx, rx) = stream_channel();
        drop(rx);
        emit(
            &Some(tx),
            StreamEvent::Debug {
                step: 0,
                name: "noop".into(),
                payload: json!(null),
            },
        );
    }
}
