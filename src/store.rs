//! Top-level store (C6 Operation Engine) for hybridkv
//!
//! `HybridKv` wires the hybrid log, hash index, epoch manager, checkpoint
//! coordinator and background task manager together and exposes the four
//! foreground operations — Upsert, Read, RMW, Delete — as lock-free
//! compare-and-swap retry loops against the index, following FASTER's
//! `FasterKv` operation engine.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::background::{BackgroundTaskManager, BackgroundTaskStats};
use crate::checkpoint::{CheckpointCoordinator, CheckpointMetadata};
use crate::common::{Config, INVALID_ADDRESS, Key, Result, RsKvError, Value};
use crate::device::FileSystemDisk;
use crate::epoch::{EpochManager, SharedEpochManager};
use crate::gc::{GcConfig, GcEstimate, GcState, GcStats};
use crate::hlog::{HybridLog, LogRecord};
use crate::index::{KeyHasher, new_shared_hash_index};
use crate::session::Session;

/// Shared state behind every `Session`. Foreground operations borrow it
/// through a session; background tasks hold their own clone.
pub struct StoreInner {
    pub(crate) hlog: Arc<HybridLog>,
    pub(crate) index: crate::index::SharedHashIndex,
    pub(crate) epoch: SharedEpochManager,
    pub(crate) config: Config,
    checkpoint_version: AtomicU32,
    checkpoint: Arc<CheckpointCoordinator>,
    gc: Arc<GcState>,
}

impl StoreInner {
    fn current_checkpoint_version(&self) -> u32 {
        self.checkpoint_version.load(Ordering::Acquire)
    }

    /// The ring buffer has no free pages. Drive one cycle of
    /// shift-read-only / flush / shift-head so the next `allocate` succeeds.
    /// Mirrors FASTER's `Refresh`-triggered page eviction.
    async fn drive_capacity_cycle(&self) -> Result<()> {
        let cut = self.hlog.shift_read_only_address();
        self.hlog.flush_to_disk(cut).await?;
        let trigger_epoch = self.epoch.bump_epoch();
        self.hlog.shift_head_address(cut, trigger_epoch)?;
        Ok(())
    }

    /// Walk a version chain starting at `address` looking for `key`,
    /// resolving `PendingIo` from the device as needed. `None` means no
    /// live (non-tombstone) record for this key exists.
    fn resolve_chain(&self, key: &Key, mut address: u64) -> Result<Option<Value>> {
        Ok(self.resolve_chain_with_address(key, address)?.map(|(value, _)| value))
    }

    /// Like `resolve_chain`, but also returns the address the live record
    /// was found at, so callers can decide whether it's worth promoting to
    /// the tail (`CopyReadsToTail`).
    fn resolve_chain_with_address(&self, key: &Key, mut address: u64) -> Result<Option<(Value, u64)>> {
        loop {
            if address == INVALID_ADDRESS {
                return Ok(None);
            }
            let record = match self.hlog.read_record(address) {
                Ok(record) => record,
                Err(RsKvError::PendingIo) => self.hlog.read_record_from_device(address)?,
                Err(RsKvError::KeyNotFound) => return Ok(None),
                Err(e) => return Err(e),
            };
            if record.key == *key {
                return Ok(if record.header.tombstone {
                    None
                } else {
                    Some((record.value, address))
                });
            }
            address = record.header.previous_address;
        }
    }
}

/// A persistent, embedded hybrid-log key-value store.
pub struct HybridKv {
    inner: Arc<StoreInner>,
    background: Arc<BackgroundTaskManager>,
}

impl HybridKv {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        log::info!("initializing hybridkv store");

        let storage_path = Path::new(&config.storage_dir);
        std::fs::create_dir_all(storage_path)?;

        let epoch = Arc::new(EpochManager::new());

        let log_path = storage_path.join("hybridkv.log");
        let device = Box::new(FileSystemDisk::new(log_path)?);
        let hlog = Arc::new(HybridLog::new(
            config.memory_size,
            config.page_bits,
            device,
            epoch.clone(),
        )?);

        let index = new_shared_hash_index(config.num_buckets);

        let checkpoint_dir = storage_path.join("checkpoints");
        let checkpoint = Arc::new(CheckpointCoordinator::new(
            checkpoint_dir,
            hlog.clone(),
            index.clone(),
            epoch.clone(),
            config.checkpoint_kind,
        )?);

        let gc = Arc::new(GcState::new(hlog.clone(), epoch.clone()));

        if let Some(metadata) = checkpoint.recover_from_latest().await? {
            hlog.restore_addresses(
                metadata.log_metadata.begin_address,
                metadata.log_metadata.tail_address,
            );
            log::info!(
                "recovered from checkpoint {} ({} index entries)",
                metadata.checkpoint_id,
                metadata.index_metadata.entry_count
            );
        } else {
            log::info!("no checkpoint found, starting with an empty store");
        }

        let inner = Arc::new(StoreInner {
            hlog,
            index,
            epoch,
            config: config.clone(),
            checkpoint_version: AtomicU32::new(0),
            checkpoint: checkpoint.clone(),
            gc: gc.clone(),
        });

        let background = Arc::new(BackgroundTaskManager::new(config.clone(), checkpoint, gc));
        if config.enable_checkpointing || config.enable_gc {
            background.start()?;
        }

        Ok(Self { inner, background })
    }

    /// Start a new session, the handle through which operations reach the
    /// store. Sessions are cheap but not free (an epoch slot); reuse one
    /// per worker thread rather than creating one per call.
    pub fn start_session(&self, affinitized: bool) -> Session {
        Session::new(self.inner.clone(), &self.inner.epoch, affinitized)
    }

    /// Insert or update a key. Attempts an in-place overwrite first if the
    /// existing record is still in the mutable region (invariant I2);
    /// otherwise appends a new version and CASes the index forward.
    pub async fn upsert(&self, session: &mut Session, key: Key, value: Value) -> Result<()> {
        session.refresh();
        let hash = KeyHasher::hash_key(&key);

        loop {
            let current = self.inner.index.find(hash).unwrap_or(INVALID_ADDRESS);

            if current != INVALID_ADDRESS
                && self.inner.hlog.is_mutable(current)
                && let Ok(existing) = self.inner.hlog.read_record(current)
                && existing.key == key
            {
                let record = LogRecord::new(
                    key.clone(),
                    value.clone(),
                    existing.header.previous_address,
                    self.inner.current_checkpoint_version(),
                );
                if self.inner.hlog.update_record_in_place(current, &record).is_ok() {
                    return Ok(());
                }
            }

            let record = LogRecord::new(
                key.clone(),
                value.clone(),
                current,
                self.inner.current_checkpoint_version(),
            );
            match self.inner.hlog.insert_record(&record) {
                Ok(new_address) => {
                    if self.inner.index.compare_and_update(hash, current, new_address) {
                        return Ok(());
                    }
                    // A concurrent writer raced us to the index slot; the
                    // just-inserted record is superseded but harmless, retry.
                }
                Err(RsKvError::NeedsRefresh) => {
                    self.inner.drive_capacity_cycle().await?;
                    session.refresh();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the current value for `key`, or `None` if absent or tombstoned.
    /// When `Config::copy_reads_to_tail` is set, a hit resolved below
    /// `ReadOnlyAddress` (on-disk or read-only in-memory) is re-appended at
    /// the tail and the index is advanced to point at the copy, so future
    /// reads of a hot cold-region key become mutable-region hits.
    pub async fn read(&self, session: &mut Session, key: &Key) -> Result<Option<Value>> {
        session.refresh();
        let hash = KeyHasher::hash_key(key);
        let Some(head) = self.inner.index.find(hash) else {
            return Ok(None);
        };
        let Some((value, found_address)) = self.inner.resolve_chain_with_address(key, head)? else {
            return Ok(None);
        };

        if self.inner.config.copy_reads_to_tail && found_address < self.inner.hlog.read_only_address() {
            self.copy_to_tail(session, key, &value, hash, head).await;
        }

        Ok(Some(value))
    }

    /// Best-effort promotion of a cold read to the tail. Losing the race
    /// against a concurrent writer (or hitting `NeedsRefresh`) just means
    /// the next read tries again; it never affects the value returned to
    /// the caller that triggered it.
    async fn copy_to_tail(&self, session: &mut Session, key: &Key, value: &Value, hash: u64, current: u64) {
        let record = LogRecord::new(
            key.clone(),
            value.clone(),
            current,
            self.inner.current_checkpoint_version(),
        );
        match self.inner.hlog.insert_record(&record) {
            Ok(new_address) => {
                let _ = self.inner.index.compare_and_update(hash, current, new_address);
            }
            Err(RsKvError::NeedsRefresh) => {
                if self.inner.drive_capacity_cycle().await.is_ok() {
                    session.refresh();
                }
            }
            Err(_) => {}
        }
    }

    /// Atomically read-modify-write a key. `updater` receives the current
    /// value (`None` if absent/tombstoned) and returns the value to store.
    /// Retries under CAS contention; `updater` may be called more than once
    /// and must be a pure function of its input.
    pub async fn rmw<F>(&self, session: &mut Session, key: Key, updater: F) -> Result<()>
    where
        F: Fn(Option<&Value>) -> Value,
    {
        session.refresh();
        let hash = KeyHasher::hash_key(&key);

        loop {
            let current = self.inner.index.find(hash).unwrap_or(INVALID_ADDRESS);
            let existing = self.inner.resolve_chain(&key, current)?;
            let new_value = updater(existing.as_ref());

            let record = LogRecord::new(
                key.clone(),
                new_value,
                current,
                self.inner.current_checkpoint_version(),
            );
            match self.inner.hlog.insert_record(&record) {
                Ok(new_address) => {
                    if self.inner.index.compare_and_update(hash, current, new_address) {
                        return Ok(());
                    }
                }
                Err(RsKvError::NeedsRefresh) => {
                    self.inner.drive_capacity_cycle().await?;
                    session.refresh();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark `key` deleted by appending a tombstone record.
    pub async fn delete(&self, session: &mut Session, key: &Key) -> Result<()> {
        session.refresh();
        let hash = KeyHasher::hash_key(key);

        loop {
            let current = self.inner.index.find(hash).unwrap_or(INVALID_ADDRESS);
            let tombstone = LogRecord::tombstone(
                key.clone(),
                current,
                self.inner.current_checkpoint_version(),
            );
            match self.inner.hlog.insert_record(&tombstone) {
                Ok(new_address) => {
                    if self.inner.index.compare_and_update(hash, current, new_address) {
                        return Ok(());
                    }
                }
                Err(RsKvError::NeedsRefresh) => {
                    self.inner.drive_capacity_cycle().await?;
                    session.refresh();
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn contains_key(&self, session: &mut Session, key: &Key) -> Result<bool> {
        Ok(self.read(session, key).await?.is_some())
    }

    /// Approximate number of distinct keys ever written (includes
    /// tombstones; the index stores only tags, not full keys).
    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let tail = self.inner.hlog.tail_address();
        let head = self.inner.hlog.head_address();
        let read_only = self.inner.hlog.read_only_address();
        let begin = self.inner.hlog.begin_address();

        StoreStats {
            index_entries: self.inner.index.len(),
            log_tail_address: tail,
            log_head_address: head,
            log_read_only_address: read_only,
            log_begin_address: begin,
            mutable_region_bytes: tail.saturating_sub(read_only),
            read_only_region_bytes: read_only.saturating_sub(head),
            disk_region_bytes: head.saturating_sub(begin),
        }
    }

    pub async fn checkpoint(&self) -> Result<CheckpointMetadata> {
        let metadata = self.inner.checkpoint.run().await?;
        self.inner
            .checkpoint_version
            .fetch_add(1, Ordering::AcqRel);
        Ok(metadata)
    }

    pub async fn checkpoint_stats(&self) -> Result<crate::checkpoint::CheckpointStats> {
        self.inner.checkpoint.stats().await
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<u64>> {
        self.inner.checkpoint.list_checkpoints().await
    }

    pub async fn cleanup_checkpoints(&self, keep_count: usize) -> Result<()> {
        self.inner.checkpoint.cleanup_old_checkpoints(keep_count).await
    }

    pub async fn garbage_collect(&self) -> Result<GcStats> {
        self.garbage_collect_with_config(GcConfig::default()).await
    }

    pub async fn garbage_collect_with_config(&self, config: GcConfig) -> Result<GcStats> {
        self.inner.gc.run(&config).await
    }

    pub fn should_run_gc(&self) -> bool {
        self.inner.gc.should_run(&GcConfig::default())
    }

    pub fn gc_estimate(&self) -> GcEstimate {
        self.inner.gc.estimate()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn background_stats(&self) -> BackgroundTaskStats {
        self.background.stats()
    }

    pub async fn stop_background_tasks(&self) -> Result<()> {
        self.background.stop().await
    }

    pub fn start_background_tasks(&self) -> Result<()> {
        self.background.start()
    }

    /// Flush in-flight state, take a final checkpoint, reclaim space, and
    /// stop background maintenance. The store may still be read after
    /// `close`, but no further writes should be issued.
    pub async fn close(&self) -> Result<()> {
        log::info!("closing hybridkv store");
        self.background.stop().await?;
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        match self.checkpoint().await {
            Ok(_) => log::info!("final checkpoint completed"),
            Err(RsKvError::CheckpointFailed { message }) if message.contains("already in progress") => {
                log::info!("skipping final checkpoint, one already in progress");
            }
            Err(e) => return Err(e),
        }

        if self.should_run_gc() {
            let _ = self.garbage_collect().await?;
        }
        self.cleanup_checkpoints(3).await?;

        log::info!("store closed");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub index_entries: usize,
    pub log_tail_address: u64,
    pub log_head_address: u64,
    pub log_read_only_address: u64,
    pub log_begin_address: u64,
    pub mutable_region_bytes: u64,
    pub read_only_region_bytes: u64,
    pub disk_region_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (HybridKv, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_string_lossy().to_string(),
            memory_size: 8 * 1024 * 1024,
            page_bits: 16,
            num_buckets: 256,
            enable_checkpointing: false,
            enable_gc: false,
            ..Default::default()
        };
        (HybridKv::new(config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_upsert_read_delete() {
        let (store, _dir) = test_store().await;
        let mut session = store.start_session(false);

        let key = b"key1".to_vec();
        store.upsert(&mut session, key.clone(), b"v1".to_vec()).await.unwrap();
        assert_eq!(store.read(&mut session, &key).await.unwrap(), Some(b"v1".to_vec()));

        store.upsert(&mut session, key.clone(), b"v2".to_vec()).await.unwrap();
        assert_eq!(store.read(&mut session, &key).await.unwrap(), Some(b"v2".to_vec()));

        store.delete(&mut session, &key).await.unwrap();
        assert_eq!(store.read(&mut session, &key).await.unwrap(), None);
        assert!(!store.contains_key(&mut session, &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_rmw_counter() {
        let (store, _dir) = test_store().await;
        let mut session = store.start_session(false);
        let key = b"counter".to_vec();

        for _ in 0..5 {
            store
                .rmw(&mut session, key.clone(), |existing| {
                    let n = existing
                        .map(|v| u64::from_le_bytes(v.clone().try_into().unwrap()))
                        .unwrap_or(0);
                    (n + 1).to_le_bytes().to_vec()
                })
                .await
                .unwrap();
        }

        let value = store.read(&mut session, &key).await.unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 5);
    }

    #[tokio::test]
    async fn test_multiple_keys_and_stats() {
        let (store, _dir) = test_store().await;
        let mut session = store.start_session(false);

        for i in 0..10u32 {
            let key = format!("key-{i}").into_bytes();
            store.upsert(&mut session, key, format!("value-{i}").into_bytes()).await.unwrap();
        }

        assert_eq!(store.len(), 10);
        let stats = store.stats();
        assert_eq!(stats.index_entries, 10);
        assert!(stats.log_tail_address > stats.log_head_address);
    }

    #[tokio::test]
    async fn test_copy_reads_to_tail_promotes_cold_record() {
        let dir = tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_string_lossy().to_string(),
            memory_size: 8 * 1024 * 1024,
            page_bits: 16,
            num_buckets: 256,
            enable_checkpointing: false,
            enable_gc: false,
            copy_reads_to_tail: true,
            ..Default::default()
        };
        let store = HybridKv::new(config).await.unwrap();
        let mut session = store.start_session(false);
        let key = b"cold".to_vec();
        store.upsert(&mut session, key.clone(), b"v1".to_vec()).await.unwrap();

        // Push the record out of the mutable region.
        store.inner.hlog.shift_read_only_address();
        let address_before = store.inner.index.find(KeyHasher::hash_key(&key)).unwrap();
        assert!(!store.inner.hlog.is_mutable(address_before));

        assert_eq!(store.read(&mut session, &key).await.unwrap(), Some(b"v1".to_vec()));

        let address_after = store.inner.index.find(KeyHasher::hash_key(&key)).unwrap();
        assert!(address_after > address_before);
        assert!(store.inner.hlog.is_mutable(address_after));
    }

    #[tokio::test]
    async fn test_checkpoint_and_recover() {
        let dir = tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_string_lossy().to_string(),
            memory_size: 8 * 1024 * 1024,
            page_bits: 16,
            num_buckets: 256,
            enable_checkpointing: false,
            enable_gc: false,
            ..Default::default()
        };

        let store = HybridKv::new(config.clone()).await.unwrap();
        let mut session = store.start_session(false);
        store
            .upsert(&mut session, b"persisted".to_vec(), b"yes".to_vec())
            .await
            .unwrap();
        store.checkpoint().await.unwrap();
        store.close().await.unwrap();

        let reopened = HybridKv::new(config).await.unwrap();
        let mut session2 = reopened.start_session(false);
        assert_eq!(
            reopened.read(&mut session2, &b"persisted".to_vec()).await.unwrap(),
            Some(b"yes".to_vec())
        );
    }
}
