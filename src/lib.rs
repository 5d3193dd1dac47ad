//! # hybridkv: A Hybrid-Log Persistent Key-Value Store
//!
//! `hybridkv` is a concurrent, persistent key-value store built around a
//! hybrid log: a large in-memory ring of pages, split into a mutable tail,
//! a read-only middle region, and a disk-resident head, backed by a
//! pluggable storage device. The design follows Microsoft's FASTER.
//!
//! ## Core Features
//!
//! - **Hybrid Storage Engine**: mutable tail, read-only middle, disk-backed head
//! - **Lock-Free Hash Index**: cache-line-sized buckets, no resizing
//! - **Non-Blocking Checkpoints**: consistent snapshots without pausing operations
//! - **Numbered-Epoch Reclamation**: safe background page eviction and GC
//!
//! ## Example
//!
//! ```rust,ignore
//! use hybridkv::{HybridKv, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store = HybridKv::new(config).await?;
//!     let mut session = store.start_session(false);
//!
//!     let key = b"hello".to_vec();
//!     let value = b"world".to_vec();
//!
//!     store.upsert(&mut session, key.clone(), value).await?;
//!     let result = store.read(&mut session, &key).await?;
//!
//!     println!("Value: {:?}", result);
//!     Ok(())
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod background;
pub mod checkpoint;
pub mod common;
pub mod device;
pub mod epoch;
pub mod gc;
pub mod hlog;
pub mod index;
pub mod metrics;
pub mod session;
pub mod store;

pub use background::{BackgroundTaskManager, BackgroundTaskStats};
pub use checkpoint::{CheckpointCoordinator, CheckpointMetadata, CheckpointStats};
pub use common::{Address, CheckpointKind, Config, Key, Result, RsKvError, Value};
pub use device::{Device, FileSystemDisk, MmapDisk};
pub use epoch::{EpochManager, EpochSlot, SharedEpochManager};
pub use gc::{GcConfig, GcEstimate, GcState, GcStats};
pub use index::{HashIndex, SharedHashIndex};
pub use metrics::{
    MetricsCollector, MetricsSnapshot, SharedMetricsCollector, new_shared_metrics_collector,
};
pub use session::Session;
pub use store::{HybridKv, StoreStats};
