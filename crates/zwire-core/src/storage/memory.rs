//! In-memory storage for tests and simulation.

use std::collections::HashMap;

use super::{compact, CacheFile, CacheRecord, Storage};
use crate::error::StorageError;

/// Storage that keeps the raw append log in memory.
///
/// Appends are never buffered, so `dirty` is always false and `flush` is
/// a no-op; the log itself is kept verbatim so tests can assert on the
/// append-only history, not just the compacted view.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: HashMap<CacheFile, Vec<CacheRecord>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw (uncompacted) log, for test assertions.
    #[must_use]
    pub fn raw_log(&self, file: CacheFile) -> &[CacheRecord] {
        self.logs.get(&file).map_or(&[], Vec::as_slice)
    }
}

impl Storage for MemoryStore {
    fn append(&mut self, file: CacheFile, record: CacheRecord) -> Result<(), StorageError> {
        self.logs.entry(file).or_default().push(record);
        Ok(())
    }

    fn load(&mut self, file: CacheFile) -> Result<Vec<CacheRecord>, StorageError> {
        Ok(compact(self.logs.get(&file).cloned().unwrap_or_default()))
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.logs.clear();
        Ok(())
    }

    fn dirty(&self) -> bool {
        false
    }
}
