//! The persistence facade.
//!
//! Three append-only logs back the driver: the network cache (topology,
//! node records), the value DB (last-reported CC values) and the metadata
//! DB. All three share one record shape — a key and a JSON value — and an
//! append-only discipline: replaying a log and keeping the last value per
//! key reconstructs the state.
//!
//! Implementations: [`MemoryStore`] for tests and simulation,
//! [`JsonlStore`] for production. Writes are coalesced by the shell over
//! the configured throttle window; `flush` is called by a timer and
//! before shutdown.

mod jsonl;
mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Version stamped into fresh network cache files.
pub const CACHE_FORMAT: u32 = 1;

/// Which of the three logs a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFile {
    /// Network cache: topology and node records
    Network,
    /// Value DB: last-reported command class values
    Values,
    /// Metadata DB
    Metadata,
}

impl CacheFile {
    /// On-disk file name, keyed by home id in hex.
    #[must_use]
    pub fn file_name(self, home_id: u32) -> String {
        match self {
            CacheFile::Network => format!("{home_id:08x}.jsonl"),
            CacheFile::Values => format!("{home_id:08x}.values.jsonl"),
            CacheFile::Metadata => format!("{home_id:08x}.metadata.jsonl"),
        }
    }

    /// All three logs.
    pub const ALL: [CacheFile; 3] = [CacheFile::Network, CacheFile::Values, CacheFile::Metadata];
}

/// One log line: a key and its JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Record key; later records with the same key shadow earlier ones
    #[serde(rename = "k")]
    pub key: String,
    /// JSON value
    #[serde(rename = "v")]
    pub value: serde_json::Value,
}

impl CacheRecord {
    /// Convenience constructor.
    #[must_use]
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self { key: key.into(), value }
    }
}

/// Flush cadence presets for the write coalescing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushThrottle {
    /// Flash-friendly: 1 s window
    Slow,
    /// Default: 150 ms window
    #[default]
    Normal,
    /// Immediate flush after every append
    Fast,
}

impl FlushThrottle {
    /// The coalescing window this preset stands for.
    #[must_use]
    pub fn window(self) -> Duration {
        match self {
            FlushThrottle::Slow => Duration::from_millis(1000),
            FlushThrottle::Normal => Duration::from_millis(150),
            FlushThrottle::Fast => Duration::ZERO,
        }
    }

    /// Parse the configuration string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "slow" => Some(FlushThrottle::Slow),
            "normal" => Some(FlushThrottle::Normal),
            "fast" => Some(FlushThrottle::Fast),
            _ => None,
        }
    }
}

/// Abstract persistence backing the driver.
pub trait Storage: Send {
    /// Append a record. Implementations may buffer until [`Storage::flush`].
    fn append(&mut self, file: CacheFile, record: CacheRecord) -> Result<(), StorageError>;

    /// Replay a log: the last record per key, in first-seen key order.
    fn load(&mut self, file: CacheFile) -> Result<Vec<CacheRecord>, StorageError>;

    /// Write out everything buffered.
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Drop all persisted and buffered state (the `NO_CACHE` path).
    fn clear(&mut self) -> Result<(), StorageError>;

    /// True when appends are buffered and a flush timer should be armed.
    fn dirty(&self) -> bool;
}

/// Keep the last record per key, preserving first-seen key order. Shared
/// by both implementations so replay semantics cannot drift.
#[must_use]
pub fn compact(records: Vec<CacheRecord>) -> Vec<CacheRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: std::collections::HashMap<String, CacheRecord> = std::collections::HashMap::new();
    for record in records {
        if !latest.contains_key(&record.key) {
            order.push(record.key.clone());
        }
        latest.insert(record.key.clone(), record);
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}
