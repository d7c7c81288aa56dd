//! Task result caching
//!
//! A node with a [`CachePolicy`] can have whole executions skipped: the
//! runner derives a key from the task's frozen input, and a fresh cache
//! entry short-circuits execution with the stored output. Entries expire
//! after the policy's TTL. Caching also doubles as the recommended escape
//! hatch for expensive work ahead of an interrupt call, since resumed
//! tasks re-execute from the top.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

/// Derives a cache key from a task's frozen input.
pub type CacheKeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Per-node caching configuration.
#[derive(Clone)]
pub struct CachePolicy {
    pub key_fn: CacheKeyFn,
    /// How long entries stay valid; `None` means forever
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn new(key_fn: CacheKeyFn, ttl: Option<Duration>) -> Self {
        Self { key_fn, ttl }
    }

    /// Key on a hash of the serialized input.
    pub fn hashed(ttl: Option<Duration>) -> Self {
        Self {
            key_fn: Arc::new(|input: &Value| {
                let mut hasher = DefaultHasher::new();
                input.to_string().hash(&mut hasher);
                format!("{:016x}", hasher.finish())
            }),
            ttl,
        }
    }

    pub fn key_for(&self, input: &Value) -> String {
        (self.key_fn)(input)
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    output: Value,
    expires_at: Option<Instant>,
}

/// Process-local store of cached task outputs, shared by the runner across
/// supersteps.
#[derive(Debug, Default)]
pub struct TaskCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh output for `key`, if present and unexpired. Expired entries
    /// are evicted on access.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.output.clone())
                }
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, output: Value, ttl: Option<Duration>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                CacheEntry {
                    output,
                    expires_at: ttl.map(|d| Instant::now() + d),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
