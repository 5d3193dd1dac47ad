//! Background task management for hybridkv
//!
//! Periodic checkpoint and garbage-collection tasks, run as independent
//! tokio tasks gated on `Config::enable_checkpointing`/`enable_gc`. Unlike
//! the foreground operation engine, background tasks coordinate with each
//! other only through the `CheckpointCoordinator`'s own phase guard and
//! `GcState`'s `in_progress` flag — there is no separate outer lock, since
//! both are already safe to call concurrently with foreground traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::checkpoint::CheckpointCoordinator;
use crate::common::{Config, Result, RsKvError};
use crate::gc::{GcConfig, GcState};

pub struct BackgroundTaskManager {
    running: Arc<AtomicBool>,
    config: Config,
    checkpoint: Arc<CheckpointCoordinator>,
    gc: Arc<GcState>,
    task_handles: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BackgroundTaskManager {
    pub fn new(config: Config, checkpoint: Arc<CheckpointCoordinator>, gc: Arc<GcState>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            config,
            checkpoint,
            gc,
            task_handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RsKvError::Internal {
                message: "background tasks are already running".to_string(),
            });
        }

        log::info!("starting background task manager");
        let mut handles = self.task_handles.lock();

        if self.config.enable_checkpointing {
            handles.push(self.start_checkpoint_task());
        }
        if self.config.enable_gc {
            handles.push(self.start_gc_task());
        }

        log::info!("started {} background tasks", handles.len());
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        log::info!("stopping background tasks");
        let handles = {
            let mut handles = self.task_handles.lock();
            std::mem::take(&mut *handles)
        };

        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        log::info!("all background tasks stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn start_checkpoint_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let checkpoint = self.checkpoint.clone();
        let interval_ms = self.config.checkpoint_interval_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("checkpoint task started with interval {interval_ms}ms");

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }

                if checkpoint.is_in_progress() {
                    log::debug!("skipping checkpoint tick, one already in progress");
                    continue;
                }

                match checkpoint.run().await {
                    Ok(metadata) => {
                        log::debug!("background checkpoint {} completed", metadata.checkpoint_id);
                    }
                    Err(e) => log::warn!("background checkpoint failed: {e}"),
                }
            }

            log::info!("checkpoint task stopped");
        })
    }

    fn start_gc_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let gc = self.gc.clone();
        let interval_ms = self.config.gc_interval_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("gc task started with interval {interval_ms}ms");

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }

                let gc_config = GcConfig::default();
                if !gc.should_run(&gc_config) {
                    log::trace!("gc not needed");
                    continue;
                }

                match gc.run(&gc_config).await {
                    Ok(stats) => {
                        log::debug!("background gc reclaimed {} bytes", stats.bytes_reclaimed);
                    }
                    Err(e) => log::warn!("background gc failed: {e}"),
                }
            }

            log::info!("gc task stopped");
        })
    }

    pub fn stats(&self) -> BackgroundTaskStats {
        BackgroundTaskStats {
            is_running: self.is_running(),
            checkpoint_enabled: self.config.enable_checkpointing,
            gc_enabled: self.config.enable_gc,
            checkpoint_interval_ms: self.config.checkpoint_interval_ms,
            gc_interval_ms: self.config.gc_interval_ms,
            active_task_count: self.task_handles.lock().len(),
        }
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        let handles = {
            let mut handles = self.task_handles.lock();
            std::mem::take(&mut *handles)
        };
        if self.running.swap(false, Ordering::AcqRel) {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundTaskStats {
    pub is_running: bool,
    pub checkpoint_enabled: bool,
    pub gc_enabled: bool,
    pub checkpoint_interval_ms: u64,
    pub gc_interval_ms: u64,
    pub active_task_count: usize,
}
