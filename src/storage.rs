//! Storage layer: RocksDB for production, an in-memory map for tests, and the
//! `WriteSet` used to stage one atomic, version-guarded batch.

use crate::common::traits::{KvStore, WriteOp};
use crate::config::StorageConfig;
use crate::errors::{EngineError, EngineResult};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct OptimizedStorage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl OptimizedStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        Self::with_config(&StorageConfig {
            data_directory: path.as_ref().to_string_lossy().into_owned(),
            ..StorageConfig::default()
        })
    }

    pub fn with_config(config: &StorageConfig) -> EngineResult<Self> {
        if config.clear_on_start && Path::new(&config.data_directory).exists() {
            std::fs::remove_dir_all(&config.data_directory).map_err(|e| {
                EngineError::PersistenceFailure(format!(
                    "Failed to clear {}: {}",
                    config.data_directory, e
                ))
            })?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.set_compression_type(compression_type(&config.compression));

        let db = DB::open(&opts, &config.data_directory)?;
        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }
}

fn compression_type(name: &str) -> rocksdb::DBCompressionType {
    match name.to_ascii_lowercase().as_str() {
        "none" => rocksdb::DBCompressionType::None,
        "snappy" => rocksdb::DBCompressionType::Snappy,
        "zstd" => rocksdb::DBCompressionType::Zstd,
        _ => rocksdb::DBCompressionType::Lz4,
    }
}

impl KvStore for OptimizedStorage {
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> EngineResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = match start_after {
            Some(cursor) if cursor.starts_with(prefix) => cursor,
            _ => prefix,
        };

        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if start_after == Some(&key[..]) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> EngineResult<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.put(key, value),
                WriteOp::Delete { key } => batch.delete(key),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

/// In-memory store with the same ordering and atomicity as RocksDB.
///
/// Writes can be made to fail, either all of them or only batches touching a
/// key prefix, to exercise the rollback paths.
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_prefix: RwLock<Option<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail any batch containing a key with this prefix
    pub fn fail_writes_with_prefix(&self, prefix: Option<&str>) {
        if let Ok(mut guard) = self.fail_prefix.write() {
            *guard = prefix.map(|p| p.as_bytes().to_vec());
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw overwrite that bypasses every guard, standing in for another writer
    pub fn put_raw(&self, key: &[u8], value: &[u8]) {
        if let Ok(mut data) = self.data.write() {
            data.insert(key.to_vec(), value.to_vec());
        }
    }
}

impl KvStore for MemoryStorage {
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|_| EngineError::PersistenceFailure("memory store poisoned".into()))?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> EngineResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self
            .data
            .read()
            .map_err(|_| EngineError::PersistenceFailure("memory store poisoned".into()))?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| start_after.map_or(true, |after| k.as_slice() > after))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::PersistenceFailure("injected write failure".into()));
        }
        if let Ok(guard) = self.fail_prefix.read() {
            if let Some(prefix) = guard.as_ref() {
                if ops.iter().any(|op| op.key().starts_with(prefix)) {
                    return Err(EngineError::PersistenceFailure(format!(
                        "injected write failure for {}",
                        String::from_utf8_lossy(prefix)
                    )));
                }
            }
        }

        let mut data = self
            .data
            .write()
            .map_err(|_| EngineError::PersistenceFailure("memory store poisoned".into()))?;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u64,
}

#[derive(Debug, Clone)]
enum Expectation {
    Absent,
    Version(u64),
}

/// Staged mutations plus the preconditions they were computed under.
///
/// `commit` re-reads every guarded key and refuses the whole batch with
/// `LedgerConflict` if any of them moved.
#[derive(Default, Debug)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
    guards: Vec<(Vec<u8>, Expectation)>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_json<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> EngineResult<()> {
        let value = serde_json::to_vec(value)?;
        self.ops.push(WriteOp::Put { key, value });
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    /// Require the stored record at `key` to carry `version` (or be missing when `None`)
    pub fn expect_version(&mut self, key: Vec<u8>, version: Option<u64>) {
        let expectation = match version {
            Some(v) => Expectation::Version(v),
            None => Expectation::Absent,
        };
        self.guards.push((key, expectation));
    }

    pub fn expect_absent(&mut self, key: Vec<u8>) {
        self.guards.push((key, Expectation::Absent));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn check(&self, store: &dyn KvStore) -> EngineResult<()> {
        for (key, expectation) in &self.guards {
            let current = store.get(key)?;
            let ok = match (expectation, current) {
                (Expectation::Absent, None) => true,
                (Expectation::Absent, Some(_)) => false,
                (Expectation::Version(_), None) => false,
                (Expectation::Version(expected), Some(bytes)) => {
                    let probe: VersionProbe = serde_json::from_slice(&bytes)?;
                    probe.version == *expected
                }
            };
            if !ok {
                return Err(EngineError::LedgerConflict(format!(
                    "{} changed underneath this write ({:?})",
                    String::from_utf8_lossy(key),
                    expectation
                )));
            }
        }
        Ok(())
    }

    /// Check guards, then write everything in one batch
    pub fn commit(self, store: &dyn KvStore) -> EngineResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.check(store)?;
        tracing::debug!(ops = self.ops.len(), guards = self.guards.len(), "committing write set");
        store.write_batch(self.ops)
    }
}

/// Run `op` again after a `LedgerConflict`, up to `retries` extra times.
/// Each attempt re-reads its inputs, so a retry sees the other writer's result.
pub fn retry_on_conflict<T, F>(retries: u32, operation: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> EngineResult<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Err(EngineError::LedgerConflict(reason)) if attempt < retries => {
                attempt += 1;
                tracing::warn!(operation, attempt, %reason, "version conflict, retrying");
            }
            other => return other,
        }
    }
}
