//! Checkpoint coordinator (C8) for hybridkv
//!
//! Non-blocking checkpointing inspired by FASTER's design: a checkpoint cuts
//! the log at the current tail, lets in-flight operations from before the
//! cut drain, flushes up to the cut, and persists the index plus log
//! metadata — all without pausing foreground Upsert/Read/RMW/Delete calls.
//!
//! Phases follow spec.md's state machine: `Rest -> Prepare -> InProgress ->
//! WaitPending -> WaitFlush -> PersistenceCallback -> Rest`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tokio::time::Instant;

use crate::common::{Address, CheckpointKind, Result, RsKvError};
use crate::epoch::SharedEpochManager;
use crate::hlog::HybridLog;
use crate::index::{KeyHasher, SharedHashIndex};

/// Checkpoint coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Rest,
    Prepare,
    InProgress,
    WaitPending,
    WaitFlush,
    PersistenceCallback,
}

/// Metadata for a checkpoint, sufficient to drive recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: u64,
    pub timestamp_millis: u64,
    pub log_metadata: LogMetadata,
    pub index_metadata: IndexMetadata,
    pub format_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    pub begin_address: Address,
    pub head_address: Address,
    pub read_only_address: Address,
    pub tail_address: Address,
    pub flushed_until_address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub entry_count: usize,
    pub snapshot_hash: u64,
}

/// Drives the checkpoint phase machine and persists/restores checkpoints.
pub struct CheckpointCoordinator {
    checkpoint_id: AtomicU64,
    phase: parking_lot::Mutex<Phase>,
    checkpoint_dir: PathBuf,
    hlog: Arc<HybridLog>,
    index: SharedHashIndex,
    epoch: SharedEpochManager,
    kind: CheckpointKind,
    start_time: parking_lot::Mutex<Option<Instant>>,
}

impl CheckpointCoordinator {
    pub fn new(
        checkpoint_dir: PathBuf,
        hlog: Arc<HybridLog>,
        index: SharedHashIndex,
        epoch: SharedEpochManager,
        kind: CheckpointKind,
    ) -> Result<Self> {
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            checkpoint_id: AtomicU64::new(1),
            phase: parking_lot::Mutex::new(Phase::Rest),
            checkpoint_dir,
            hlog,
            index,
            epoch,
            kind,
            start_time: parking_lot::Mutex::new(None),
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn is_in_progress(&self) -> bool {
        self.phase() != Phase::Rest
    }

    fn transition(&self, checkpoint_id: u64, phase: Phase) {
        *self.phase.lock() = phase;
        log::debug!("checkpoint {checkpoint_id}: entering phase {phase:?}");
    }

    /// Run one full checkpoint cycle, returning its metadata. Only one
    /// checkpoint may be in flight at a time; a concurrent call returns
    /// `CheckpointFailed`.
    pub async fn run(&self) -> Result<CheckpointMetadata> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Rest {
                return Err(RsKvError::CheckpointFailed {
                    message: "checkpoint already in progress".to_string(),
                });
            }
            *phase = Phase::Prepare;
        }

        let checkpoint_id = self.checkpoint_id.fetch_add(1, Ordering::AcqRel);
        let start_time = Instant::now();
        *self.start_time.lock() = Some(start_time);
        log::info!("initiating checkpoint {checkpoint_id}");

        self.transition(checkpoint_id, Phase::Prepare);
        let tail_before = self.hlog.tail_address();

        // Cut the log: everything before this address belongs to the
        // checkpoint; everything after belongs to the next one.
        self.transition(checkpoint_id, Phase::InProgress);
        let cut_address = self.hlog.shift_read_only_address();
        debug_assert!(cut_address <= tail_before);

        // Let sessions that were already mid-operation against addresses
        // below the cut observe the epoch bump and refresh past it.
        self.transition(checkpoint_id, Phase::WaitPending);
        let trigger_epoch = self.epoch.bump_epoch();
        self.wait_for_safe_epoch(trigger_epoch).await;

        self.transition(checkpoint_id, Phase::WaitFlush);
        self.hlog.flush_to_disk(tail_before).await?;

        self.transition(checkpoint_id, Phase::PersistenceCallback);
        let index_snapshot = self.index.snapshot_raw();
        let snapshot_hash = Self::hash_snapshot(&index_snapshot);

        let log_metadata = LogMetadata {
            begin_address: self.hlog.begin_address(),
            head_address: self.hlog.head_address(),
            read_only_address: cut_address,
            tail_address: tail_before,
            flushed_until_address: self.hlog.flushed_until_address(),
        };
        let index_metadata = IndexMetadata {
            entry_count: index_snapshot.len(),
            snapshot_hash,
        };
        let metadata = CheckpointMetadata {
            checkpoint_id,
            timestamp_millis: start_time.elapsed().as_millis() as u64,
            log_metadata,
            index_metadata,
            format_version: 1,
        };

        // The metadata record is mandatory for every checkpoint kind (it is
        // what `find_latest_checkpoint`/`recover_from_latest` key off of).
        // `FuzzyLog` skips the index snapshot and relies on
        // `recover_from_latest` rebuilding the index by scanning the log.
        let index_to_persist = match self.kind {
            CheckpointKind::Snapshot | CheckpointKind::IndexOnly => Some(index_snapshot.as_slice()),
            CheckpointKind::FuzzyLog => None,
        };
        self.write_checkpoint_files(checkpoint_id, &metadata, index_to_persist)
            .await?;

        log::info!(
            "checkpoint {checkpoint_id} completed in {:?}",
            start_time.elapsed()
        );
        self.transition(checkpoint_id, Phase::Rest);
        Ok(metadata)
    }

    async fn wait_for_safe_epoch(&self, trigger_epoch: u64) {
        let mut waited = 0;
        while self.epoch.safe_epoch() < trigger_epoch && waited < 50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
            waited += 1;
        }
    }

    fn hash_snapshot(snapshot: &[(u64, u16, Address)]) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut sorted = snapshot.to_vec();
        sorted.sort_unstable();
        let mut hasher = DefaultHasher::new();
        sorted.hash(&mut hasher);
        hasher.finish()
    }

    fn checkpoint_prefix(&self, checkpoint_id: u64) -> PathBuf {
        self.checkpoint_dir.join(format!("checkpoint_{checkpoint_id}"))
    }

    async fn write_checkpoint_files(
        &self,
        checkpoint_id: u64,
        metadata: &CheckpointMetadata,
        index_snapshot: Option<&[(u64, u16, Address)]>,
    ) -> Result<()> {
        let prefix = self.checkpoint_prefix(checkpoint_id);

        if let Some(index_snapshot) = index_snapshot {
            let index_data = bincode::serialize(index_snapshot)?;
            async_fs::write(format!("{}.index", prefix.to_string_lossy()), index_data).await?;
        }

        let meta_data = bincode::serialize(metadata)?;
        async_fs::write(format!("{}.meta", prefix.to_string_lossy()), meta_data).await?;

        log::debug!("checkpoint {checkpoint_id} files written to {}", prefix.to_string_lossy());
        Ok(())
    }

    /// Find and load the most recent checkpoint, restoring the index from
    /// it. Returns `None` if no checkpoint exists (fresh store).
    pub async fn recover_from_latest(&self) -> Result<Option<CheckpointMetadata>> {
        let Some(checkpoint_id) = self.find_latest_checkpoint().await? else {
            log::info!("no checkpoint found, starting fresh");
            return Ok(None);
        };

        log::info!("recovering from checkpoint {checkpoint_id}");
        let prefix = self.checkpoint_prefix(checkpoint_id);

        let meta_data = async_fs::read(format!("{}.meta", prefix.to_string_lossy())).await?;
        let metadata: CheckpointMetadata = bincode::deserialize(&meta_data)?;

        let index_path = format!("{}.index", prefix.to_string_lossy());
        if async_fs::metadata(&index_path).await.is_ok() {
            let index_data = async_fs::read(&index_path).await?;
            let index_snapshot: Vec<(u64, u16, Address)> = bincode::deserialize(&index_data)?;

            let calculated = Self::hash_snapshot(&index_snapshot);
            if calculated != metadata.index_metadata.snapshot_hash {
                return Err(RsKvError::CorruptedMetadata {
                    message: format!(
                        "index snapshot hash mismatch: expected {}, got {calculated}",
                        metadata.index_metadata.snapshot_hash
                    ),
                });
            }

            for (bucket_index, tag, address) in &index_snapshot {
                self.index.restore_raw(*bucket_index, *tag, *address)?;
            }
        } else {
            log::info!(
                "checkpoint {checkpoint_id} has no index snapshot, rebuilding by scanning the log from 0x{:x}",
                metadata.log_metadata.begin_address
            );
            self.rebuild_index_from_log(&metadata.log_metadata)?;
        }

        log::info!("checkpoint {checkpoint_id} loaded successfully");
        Ok(Some(metadata))
    }

    /// Restore index chains by replaying every record between
    /// `begin_address` and `tail_address` and reinstalling each key's head
    /// address in scan order. Since the log is append-only and records carry
    /// no index of their own, scanning in increasing address order and
    /// unconditionally overwriting a key's head on each sighting leaves the
    /// highest (most recent) address installed last, which is the correct
    /// head of that key's version chain.
    fn rebuild_index_from_log(&self, log_metadata: &LogMetadata) -> Result<()> {
        let mut replayed = 0usize;
        self.hlog.scan_device_records(
            log_metadata.begin_address,
            log_metadata.tail_address,
            |address, record| {
                let hash = KeyHasher::hash_key(&record.key);
                let _ = self.index.update(hash, address);
                replayed += 1;
            },
        )?;
        log::info!("rebuilt index from log scan: {replayed} records replayed");
        Ok(())
    }

    async fn find_latest_checkpoint(&self) -> Result<Option<u64>> {
        let mut entries = async_fs::read_dir(&self.checkpoint_dir).await?;
        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_str) = name.strip_prefix("checkpoint_").and_then(|s| s.strip_suffix(".meta"))
                && let Ok(id) = id_str.parse::<u64>()
            {
                latest = Some(latest.unwrap_or(0).max(id));
            }
        }
        Ok(latest)
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<u64>> {
        let mut entries = async_fs::read_dir(&self.checkpoint_dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_str) = name.strip_prefix("checkpoint_").and_then(|s| s.strip_suffix(".meta"))
                && let Ok(id) = id_str.parse::<u64>()
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn cleanup_old_checkpoints(&self, keep_count: usize) -> Result<()> {
        let mut ids = self.list_checkpoints().await?;
        ids.sort_unstable();
        if ids.len() <= keep_count {
            return Ok(());
        }
        let to_delete = &ids[..ids.len() - keep_count];
        for &id in to_delete {
            self.delete_checkpoint(id).await?;
        }
        log::info!("cleaned up {} old checkpoints", to_delete.len());
        Ok(())
    }

    async fn delete_checkpoint(&self, checkpoint_id: u64) -> Result<()> {
        let prefix = self.checkpoint_prefix(checkpoint_id);
        for suffix in [".meta", ".index"] {
            let path = format!("{}{suffix}", prefix.to_string_lossy());
            if async_fs::metadata(&path).await.is_ok() {
                async_fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<CheckpointStats> {
        let ids = self.list_checkpoints().await?;
        let mut total_size = 0u64;
        for &id in &ids {
            let prefix = self.checkpoint_prefix(id);
            for suffix in [".meta", ".index"] {
                let path = format!("{}{suffix}", prefix.to_string_lossy());
                if let Ok(meta) = async_fs::metadata(&path).await {
                    total_size += meta.len();
                }
            }
        }
        Ok(CheckpointStats {
            total_checkpoints: ids.len(),
            total_size_bytes: total_size,
            latest_checkpoint_id: ids.last().copied(),
            in_progress: self.is_in_progress(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStats {
    pub total_checkpoints: usize,
    pub total_size_bytes: u64,
    pub latest_checkpoint_id: Option<u64>,
    pub in_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileSystemDisk;
    use crate::epoch::new_shared_epoch_manager;
    use crate::hlog::LogRecord;
    use crate::index::new_shared_hash_index;
    use tempfile::tempdir;

    async fn test_coordinator() -> (CheckpointCoordinator, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let checkpoint_dir = temp_dir.path().join("checkpoints");
        let epoch = new_shared_epoch_manager();
        let device = Box::new(FileSystemDisk::new(temp_dir.path().join("test.log")).unwrap());
        let hlog = Arc::new(HybridLog::new(4 * 1024 * 1024, 16, device, epoch.clone()).unwrap());
        let index = new_shared_hash_index(64);

        let coordinator = CheckpointCoordinator::new(
            checkpoint_dir,
            hlog,
            index,
            epoch,
            CheckpointKind::Snapshot,
        )
        .unwrap();
        (coordinator, temp_dir)
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let (coordinator, _dir) = test_coordinator().await;

        let hash = crate::index::KeyHasher::hash_key(b"key1");
        let record = LogRecord::new(b"key1".to_vec(), b"value1".to_vec(), 0, 0);
        let address = coordinator.hlog.insert_record(&record).unwrap();
        coordinator.index.update(hash, address).unwrap();

        let metadata = coordinator.run().await.unwrap();
        assert_eq!(metadata.index_metadata.entry_count, 1);
        assert!(!coordinator.is_in_progress());

        coordinator.index.clear();
        assert_eq!(coordinator.index.len(), 0);

        let recovered = coordinator.recover_from_latest().await.unwrap();
        assert!(recovered.is_some());
        assert_eq!(coordinator.index.find(hash), Some(address));
    }

    #[tokio::test]
    async fn test_fuzzy_checkpoint_rebuilds_index_from_log() {
        let temp_dir = tempdir().unwrap();
        let checkpoint_dir = temp_dir.path().join("checkpoints");
        let epoch = new_shared_epoch_manager();
        let device = Box::new(FileSystemDisk::new(temp_dir.path().join("test.log")).unwrap());
        let hlog = Arc::new(HybridLog::new(4 * 1024 * 1024, 16, device, epoch.clone()).unwrap());
        let index = new_shared_hash_index(64);
        let coordinator = CheckpointCoordinator::new(
            checkpoint_dir,
            hlog,
            index,
            epoch,
            CheckpointKind::FuzzyLog,
        )
        .unwrap();

        let hash = crate::index::KeyHasher::hash_key(b"key1");
        let record = LogRecord::new(b"key1".to_vec(), b"value1".to_vec(), 0, 0);
        let address = coordinator.hlog.insert_record(&record).unwrap();
        coordinator.index.update(hash, address).unwrap();
        coordinator.hlog.flush_to_disk(coordinator.hlog.tail_address()).await.unwrap();

        let metadata = coordinator.run().await.unwrap();
        let prefix = coordinator.checkpoint_prefix(metadata.checkpoint_id);
        assert!(
            async_fs::metadata(format!("{}.index", prefix.to_string_lossy()))
                .await
                .is_err(),
            "FuzzyLog checkpoints must not persist an index snapshot"
        );
        assert!(
            async_fs::metadata(format!("{}.meta", prefix.to_string_lossy()))
                .await
                .is_ok(),
            "every checkpoint kind must persist the metadata record"
        );

        coordinator.index.clear();
        assert_eq!(coordinator.index.len(), 0);

        let recovered = coordinator.recover_from_latest().await.unwrap();
        assert!(recovered.is_some());
        assert_eq!(coordinator.index.find(hash), Some(address));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_latest() {
        let (coordinator, _dir) = test_coordinator().await;
        for i in 0..5u64 {
            let hash = crate::index::KeyHasher::hash_key(format!("k{i}").as_bytes());
            let record = LogRecord::new(format!("k{i}").into_bytes(), b"v".to_vec(), 0, 0);
            let address = coordinator.hlog.insert_record(&record).unwrap();
            coordinator.index.update(hash, address).unwrap();
            coordinator.run().await.unwrap();
        }

        let before = coordinator.list_checkpoints().await.unwrap();
        assert_eq!(before.len(), 5);

        coordinator.cleanup_old_checkpoints(2).await.unwrap();
        let after = coordinator.list_checkpoints().await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_stats_reports_counts() {
        let (coordinator, _dir) = test_coordinator().await;
        let before = coordinator.stats().await.unwrap();
        assert_eq!(before.total_checkpoints, 0);

        coordinator.run().await.unwrap();
        let after = coordinator.stats().await.unwrap();
        assert_eq!(after.total_checkpoints, 1);
        assert_eq!(after.latest_checkpoint_id, Some(1));
    }
}
