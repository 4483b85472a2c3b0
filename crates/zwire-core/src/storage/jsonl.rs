//! JSONL-file storage: three append-only logs under the cache directory.
//!
//! Each log line is one [`CacheRecord`] as JSON. A fresh network cache is
//! stamped with a `cacheFormat` record; an existing one written by a
//! newer build is refused rather than corrupted. Individual unparseable
//! lines are logged and skipped — a torn tail from a crash must not take
//! the whole cache down.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{compact, CacheFile, CacheRecord, Storage, CACHE_FORMAT};
use crate::error::StorageError;

/// Key of the format-version record in the network cache.
const FORMAT_KEY: &str = "cacheFormat";

/// File-backed storage with write buffering.
///
/// Appends land in an in-memory buffer; the shell calls [`Storage::flush`]
/// on its coalescing timer and before shutdown.
pub struct JsonlStore {
    dir: PathBuf,
    home_id: u32,
    pending: Vec<(CacheFile, CacheRecord)>,
}

impl JsonlStore {
    /// Open (or create) the logs for `home_id` under `dir`.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnsupportedFormat`] when the existing network cache
    /// was written by a newer build; I/O errors creating the directory.
    pub fn open(dir: impl Into<PathBuf>, home_id: u32) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut store = Self { dir, home_id, pending: Vec::new() };

        let network = store.read_log(CacheFile::Network)?;
        match network.iter().find(|record| record.key == FORMAT_KEY) {
            Some(record) => {
                let found = record.value.as_u64().unwrap_or(0) as u32;
                if found > CACHE_FORMAT {
                    return Err(StorageError::UnsupportedFormat {
                        found,
                        expected: CACHE_FORMAT,
                    });
                }
            },
            None => {
                // Fresh (or pre-versioning) cache: stamp it.
                store.pending.push((
                    CacheFile::Network,
                    CacheRecord::new(FORMAT_KEY, serde_json::json!(CACHE_FORMAT)),
                ));
                store.flush()?;
            },
        }
        Ok(store)
    }

    fn path(&self, file: CacheFile) -> PathBuf {
        self.dir.join(file.file_name(self.home_id))
    }

    fn read_log(&self, file: CacheFile) -> Result<Vec<CacheRecord>, StorageError> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut records = Vec::new();
        for (line_number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CacheRecord>(&line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    // Unreadable lines fall through to "absent".
                    tracing::warn!(
                        path = %path.display(),
                        line = line_number + 1,
                        %error,
                        "skipping unparseable cache line"
                    );
                },
            }
        }
        Ok(records)
    }

    fn append_lines(path: &Path, records: &[CacheRecord]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

impl Storage for JsonlStore {
    fn append(&mut self, file: CacheFile, record: CacheRecord) -> Result<(), StorageError> {
        self.pending.push((file, record));
        Ok(())
    }

    fn load(&mut self, file: CacheFile) -> Result<Vec<CacheRecord>, StorageError> {
        // Pending records are part of the logical log.
        let mut records = self.read_log(file)?;
        records.extend(
            self.pending
                .iter()
                .filter(|(pending_file, _)| *pending_file == file)
                .map(|(_, record)| record.clone()),
        );
        Ok(compact(records))
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        for file in CacheFile::ALL {
            let records: Vec<CacheRecord> = self
                .pending
                .iter()
                .filter(|(pending_file, _)| *pending_file == file)
                .map(|(_, record)| record.clone())
                .collect();
            if !records.is_empty() {
                Self::append_lines(&self.path(file), &records)?;
            }
        }
        self.pending.clear();
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.pending.clear();
        for file in CacheFile::ALL {
            let path = self.path(file);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn dirty(&self) -> bool {
        !self.pending.is_empty()
    }
}
