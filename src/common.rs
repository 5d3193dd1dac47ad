//! Common types and error definitions for hybridkv
//!
//! This module contains core data types and error handling used throughout
//! the system. Inspired by FASTER's address.h and common error handling
//! patterns.

use thiserror::Error;
use serde::{Deserialize, Serialize};

/// Synchronization mode for durability vs performance trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// No explicit sync - rely on OS page cache (fastest, least durable)
    None,
    /// Sync data to disk periodically (balanced)
    Periodic,
    /// Sync data after every write (slowest, most durable)
    Always,
}

/// Checkpoint strategy: how the mutable region is captured and how recovery
/// replays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    /// Rely on the ordinary flush pipeline; recovery replays the log tail.
    FuzzyLog,
    /// Additionally copy the mutable region to a side file before cutting.
    Snapshot,
    /// Persist only the hash index snapshot, not a log metadata cut.
    IndexOnly,
}

/// Address type representing logical addresses in the hybrid log.
/// The page/offset split is derived at runtime from `Config::page_bits`
/// rather than hard-coded, since page size is configurable per store.
pub type Address = u64;

/// Key type for the key-value store.
/// Using Vec<u8> for maximum flexibility with different key types.
pub type Key = Vec<u8>;

/// Value type for the key-value store.
/// Using Vec<u8> for maximum flexibility with different value types.
pub type Value = Vec<u8>;

/// Reserved, never-allocated address meaning "no record" / end of chain.
pub const INVALID_ADDRESS: Address = 0;

/// Number of bits of a 64-bit key hash used as the hash-bucket tag.
pub const TAG_BITS: u32 = 16;

/// Address utility functions, parameterized by the configured page size.
#[inline]
pub fn get_page(address: Address, page_bits: u32) -> u64 {
    address >> page_bits
}

#[inline]
pub fn get_offset(address: Address, page_bits: u32) -> u64 {
    address & ((1u64 << page_bits) - 1)
}

#[inline]
pub fn make_address(page: u64, offset: u64, page_bits: u32) -> Address {
    (page << page_bits) | offset
}

/// Error types for hybridkv operations.
#[derive(Error, Debug)]
pub enum RsKvError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Key not found in the store (also used for tombstoned keys).
    #[error("Key not found")]
    KeyNotFound,

    /// Transient: the caller's session epoch is stale; refresh and retry.
    #[error("operation needs a session refresh before retrying")]
    NeedsRefresh,

    /// Transient: the operation is waiting on a device read.
    #[error("operation is pending on device I/O")]
    PendingIo,

    #[error("Address out of bounds: {address}")]
    AddressOutOfBounds { address: Address },

    #[error("Page not found: {page}")]
    PageNotFound { page: u64 },

    #[error("Allocation failed: size {size}")]
    AllocationFailed { size: u32 },

    #[error("Checkpoint operation failed: {message}")]
    CheckpointFailed { message: String },

    #[error("Recovery operation failed: {message}")]
    RecoveryFailed { message: String },

    #[error("Garbage collection failed: {message}")]
    GarbageCollectionFailed { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Key is too large
    #[error("Key size {size} bytes exceeds maximum allowed size {max_size} bytes")]
    KeyTooLarge { size: usize, max_size: usize },

    /// Value is too large
    #[error("Value size {size} bytes exceeds maximum allowed size {max_size} bytes")]
    ValueTooLarge { size: usize, max_size: usize },

    /// Storage device error
    #[error("Storage device error: {message}")]
    StorageError { message: String },

    /// Data corruption detected
    #[error("Data corruption detected: {message}")]
    Corruption { message: String },

    /// Fatal: device I/O failed permanently after the retry budget. Poisons
    /// the store.
    #[error("device I/O failed permanently: {message}")]
    DeviceIoFailure { message: String },

    /// Fatal: checkpoint or recovery metadata failed its integrity check.
    /// Poisons the store.
    #[error("checkpoint metadata corrupted: {message}")]
    CorruptedMetadata { message: String },

    /// Fatal: the hash index ran out of overflow bucket capacity.
    #[error("hash index saturated")]
    IndexSaturated,

    /// The store has been poisoned by a prior fatal error.
    #[error("store has faulted and is no longer serviceable")]
    StoreFaulted,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RsKvError {
    /// Check if this error is safe to retry without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RsKvError::Io(_)
                | RsKvError::NeedsRefresh
                | RsKvError::PendingIo
                | RsKvError::StorageError { .. }
        )
    }

    /// Check if this error indicates data corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, RsKvError::Corruption { .. } | RsKvError::CorruptedMetadata { .. })
    }

    /// Check if this error indicates the store has been poisoned and every
    /// subsequent call but `close`/`Dispose` should short-circuit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RsKvError::DeviceIoFailure { .. }
                | RsKvError::CorruptedMetadata { .. }
                | RsKvError::IndexSaturated
                | RsKvError::StoreFaulted
        )
    }

    /// Check if this error is a user input error.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            RsKvError::KeyNotFound
                | RsKvError::KeyTooLarge { .. }
                | RsKvError::ValueTooLarge { .. }
                | RsKvError::InvalidConfig { .. }
        )
    }

    /// Get error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            RsKvError::Io(_) => "io",
            RsKvError::Serialization(_) => "serialization",
            RsKvError::KeyNotFound => "not_found",
            RsKvError::NeedsRefresh => "needs_refresh",
            RsKvError::PendingIo => "pending_io",
            RsKvError::AddressOutOfBounds { .. } => "addressing",
            RsKvError::PageNotFound { .. } => "addressing",
            RsKvError::AllocationFailed { .. } => "allocation",
            RsKvError::KeyTooLarge { .. } | RsKvError::ValueTooLarge { .. } => "size_limit",
            RsKvError::CheckpointFailed { .. } => "checkpoint",
            RsKvError::RecoveryFailed { .. } => "recovery",
            RsKvError::GarbageCollectionFailed { .. } => "garbage_collection",
            RsKvError::InvalidConfig { .. } => "configuration",
            RsKvError::StorageError { .. } => "storage",
            RsKvError::Corruption { .. } => "corruption",
            RsKvError::DeviceIoFailure { .. } => "device_io_failure",
            RsKvError::CorruptedMetadata { .. } => "corrupted_metadata",
            RsKvError::IndexSaturated => "index_saturated",
            RsKvError::StoreFaulted => "faulted",
            RsKvError::Internal { .. } => "internal",
        }
    }
}

impl From<std::num::TryFromIntError> for RsKvError {
    fn from(err: std::num::TryFromIntError) -> Self {
        RsKvError::Internal {
            message: format!("Integer conversion error: {}", err),
        }
    }
}

/// Result type alias for hybridkv operations.
pub type Result<T> = std::result::Result<T, RsKvError>;

/// Record header information (matches FASTER's RecordInfo).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecordInfo {
    /// Previous address in this key's version chain. Strictly decreasing
    /// along the chain.
    pub previous_address: Address,
    /// Checkpoint version active when this record was written.
    pub checkpoint_version: u32,
    /// Whether this record is marked as invalid (superseded in place).
    pub invalid: bool,
    /// Whether this is a tombstone (deleted) record.
    pub tombstone: bool,
}

impl RecordInfo {
    pub fn new(previous_address: Address, checkpoint_version: u32, tombstone: bool) -> Self {
        Self {
            previous_address,
            checkpoint_version,
            invalid: false,
            tombstone,
        }
    }

    pub fn is_null(&self) -> bool {
        self.previous_address == INVALID_ADDRESS && self.checkpoint_version == 0
    }
}

/// Configuration for a hybridkv instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Size of the hybrid log kept in memory (in bytes).
    pub memory_size: u64,
    /// log2 of the page size (e.g. 22 -> 4MB pages).
    pub page_bits: u32,
    /// Number of hash buckets, rounded to a power of two. Never resized.
    pub num_buckets: u64,
    /// Fraction of the in-memory span kept mutable; ReadOnlyAddress trails
    /// TailAddress by this fraction of memory_size.
    pub mutable_fraction: f64,
    /// Directory for storing persistent data.
    pub storage_dir: String,
    /// Checkpoint strategy.
    pub checkpoint_kind: CheckpointKind,
    /// Whether to enable periodic background checkpointing.
    pub enable_checkpointing: bool,
    /// Checkpoint interval in milliseconds.
    pub checkpoint_interval_ms: u64,
    /// Whether to enable periodic background garbage collection.
    pub enable_gc: bool,
    /// GC interval in milliseconds.
    pub gc_interval_ms: u64,
    /// Maximum number of background maintenance threads.
    pub max_background_threads: usize,
    /// Pre-allocate log file space.
    pub preallocate_log: bool,
    /// Migrate on-disk reads to the tail on access.
    pub copy_reads_to_tail: bool,
    /// Strictly bind sessions to one OS thread.
    pub affinitized_sessions: bool,
    /// Sync mode for durability vs performance trade-off.
    pub sync_mode: SyncMode,
}

impl Config {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.memory_size < 1024 * 1024 {
            return Err(RsKvError::InvalidConfig {
                message: "Memory size must be at least 1MB".to_string(),
            });
        }

        if self.memory_size > 64 * 1024 * 1024 * 1024 {
            return Err(RsKvError::InvalidConfig {
                message: "Memory size cannot exceed 64GB".to_string(),
            });
        }

        if !(12..=30).contains(&self.page_bits) {
            return Err(RsKvError::InvalidConfig {
                message: "page_bits must be between 12 (4KB) and 30 (1GB)".to_string(),
            });
        }

        if self.page_size() > self.memory_size {
            return Err(RsKvError::InvalidConfig {
                message: "Page size cannot be larger than memory size".to_string(),
            });
        }

        if self.num_buckets == 0 || !self.num_buckets.is_power_of_two() {
            return Err(RsKvError::InvalidConfig {
                message: "num_buckets must be a nonzero power of two".to_string(),
            });
        }

        if self.mutable_fraction <= 0.0 || self.mutable_fraction > 1.0 {
            return Err(RsKvError::InvalidConfig {
                message: "mutable_fraction must be in (0.0, 1.0]".to_string(),
            });
        }

        if self.storage_dir.is_empty() {
            return Err(RsKvError::InvalidConfig {
                message: "Storage directory cannot be empty".to_string(),
            });
        }

        if self.checkpoint_interval_ms < 100 {
            return Err(RsKvError::InvalidConfig {
                message: "Checkpoint interval must be at least 100ms".to_string(),
            });
        }

        if self.gc_interval_ms < 1000 {
            return Err(RsKvError::InvalidConfig {
                message: "GC interval must be at least 1000ms".to_string(),
            });
        }

        if self.max_background_threads == 0 {
            return Err(RsKvError::InvalidConfig {
                message: "Maximum background threads must be at least 1".to_string(),
            });
        }

        if self.max_background_threads > 32 {
            return Err(RsKvError::InvalidConfig {
                message: "Maximum background threads cannot exceed 32".to_string(),
            });
        }

        if self.checkpoint_interval_ms > self.gc_interval_ms {
            log::warn!(
                "Checkpoint interval ({} ms) is longer than GC interval ({} ms), this might cause performance issues",
                self.checkpoint_interval_ms,
                self.gc_interval_ms
            );
        }

        Ok(())
    }

    /// Page size in bytes, derived from `page_bits`.
    pub fn page_size(&self) -> u64 {
        1u64 << self.page_bits
    }

    /// Number of pages the in-memory buffer holds.
    pub fn buffer_pages(&self) -> u64 {
        (self.memory_size / self.page_size()).max(2)
    }

    /// Create a configuration with a given memory size, picking a page size
    /// that scales with it.
    pub fn with_memory_size(memory_size: u64) -> Result<Self> {
        let mut config = Self::default();
        config.memory_size = memory_size;

        config.page_bits = if memory_size >= 8 * 1024 * 1024 * 1024 {
            26 // 64MB pages
        } else if memory_size >= 1024 * 1024 * 1024 {
            25 // 32MB pages
        } else if memory_size >= 256 * 1024 * 1024 {
            24 // 16MB pages
        } else {
            23 // 8MB pages
        };

        config.validate()?;
        Ok(config)
    }

    /// Create a configuration optimized for high-performance scenarios.
    pub fn high_performance() -> Result<Self> {
        let mut config = Self::default();
        config.memory_size = 4 * 1024 * 1024 * 1024; // 4GB
        config.page_bits = 26; // 64MB pages
        config.checkpoint_interval_ms = 30_000;
        config.gc_interval_ms = 60_000;
        config.max_background_threads = 8;

        config.validate()?;
        Ok(config)
    }

    /// Create a configuration optimized for low-memory scenarios.
    pub fn low_memory() -> Result<Self> {
        let mut config = Self::default();
        config.memory_size = 64 * 1024 * 1024; // 64MB
        config.page_bits = 22; // 4MB pages
        config.checkpoint_interval_ms = 2_000;
        config.gc_interval_ms = 5_000;
        config.max_background_threads = 2;

        config.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_size: 1024 * 1024 * 1024, // 1GB
            page_bits: 25,                   // 32MB pages
            num_buckets: 1 << 16,
            mutable_fraction: 0.9,
            storage_dir: "./hybridkv_data".to_string(),
            checkpoint_kind: CheckpointKind::FuzzyLog,
            enable_checkpointing: true,
            checkpoint_interval_ms: 5000,
            enable_gc: true,
            gc_interval_ms: 10000,
            max_background_threads: 4,
            preallocate_log: false,
            copy_reads_to_tail: false,
            affinitized_sessions: false,
            sync_mode: SyncMode::Periodic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_utilities() {
        let page_bits = 25;
        let page = 100;
        let offset = 1024;

        let address = make_address(page, offset, page_bits);
        assert_eq!(get_page(address, page_bits), page);
        assert_eq!(get_offset(address, page_bits), offset);
    }

    #[test]
    fn test_record_info() {
        let record_info = RecordInfo::new(42, 1, false);
        assert_eq!(record_info.previous_address, 42);
        assert_eq!(record_info.checkpoint_version, 1);
        assert!(!record_info.tombstone);
        assert!(!record_info.invalid);
        assert!(!record_info.is_null());
    }

    #[test]
    fn test_null_record_info() {
        let record_info = RecordInfo::new(0, 0, false);
        assert!(record_info.is_null());
    }

    #[test]
    fn test_config_validation_rejects_bad_page_bits() {
        let mut config = Config::default();
        config.page_bits = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_non_power_of_two_buckets() {
        let mut config = Config::default();
        config.num_buckets = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_presets_are_valid() {
        assert!(Config::high_performance().is_ok());
        assert!(Config::low_memory().is_ok());
        assert!(Config::with_memory_size(512 * 1024 * 1024).is_ok());
    }
}
