//! Pluggable encoding for persisted checkpoint payloads
//!
//! Storage adapters do not hold `Checkpoint` structs directly; they push
//! them through a [`SerializerProtocol`] and persist the resulting bytes.
//! [`JsonSerializer`] is the default: checkpoint payloads carry
//! `serde_json::Value` fields and untagged version tags, both of which
//! need a self-describing format to decode. [`BincodeSerializer`] is a
//! compact alternative for fixed-shape payloads that avoid
//! `deserialize_any`.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Byte-level codec used by checkpoint storage.
pub trait SerializerProtocol: Send + Sync {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;

    /// Encode into an in-memory JSON tree instead of bytes, for adapters
    /// whose backing store is document-shaped.
    fn dumps_json<T: Serialize>(&self, value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    fn loads_json<T: for<'de> Deserialize<'de>>(&self, value: &serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// UTF-8 JSON; self-describing, so it round-trips untagged enums and raw
/// `Value` fields.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Compact binary encoding. Not self-describing: decoding a type that
/// relies on `deserialize_any` (untagged enums, `serde_json::Value`)
/// fails, so this suits fixed-shape payloads only.
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ChannelVersion, Checkpoint};
    use serde_json::json;

    #[test]
    fn json_round_trips_a_full_checkpoint() {
        let mut cp = Checkpoint::new();
        cp.channel_values.insert("state".into(), json!({"k": [1, 2]}));
        cp.channel_versions
            .insert("state".into(), ChannelVersion::Int(3));
        cp.channel_versions
            .insert("score".into(), ChannelVersion::Float(1.5));

        let s = JsonSerializer::new();
        let bytes = s.dumps(&cp).unwrap();
        let back: Checkpoint = s.loads(&bytes).unwrap();
        assert_eq!(back.id, cp.id);
        assert_eq!(back.channel_values, cp.channel_values);
        assert_eq!(back.channel_versions, cp.channel_versions);
    }

    #[test]
    fn bincode_round_trips_fixed_shape_payloads() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct WriteBatch {
            task_id: String,
            idx: usize,
        }
        let batch = WriteBatch {
            task_id: "cp:node".into(),
            idx: 2,
        };

        let s = BincodeSerializer::new();
        let bytes = s.dumps(&batch).unwrap();
        let back: WriteBatch = s.loads(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn json_tree_encoding_matches_byte_encoding() {
        let mut cp = Checkpoint::new();
        cp.channel_versions
            .insert("state".into(), ChannelVersion::Int(1));

        let s = JsonSerializer::new();
        let tree = s.dumps_json(&cp).unwrap();
        let from_tree: Checkpoint = s.loads_json(&tree).unwrap();
        let from_bytes: Checkpoint = s.loads(&s.dumps(&cp).unwrap()).unwrap();
        assert_eq!(from_tree.channel_versions, from_bytes.channel_versions);
    }
}
