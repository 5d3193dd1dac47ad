//! Epoch-based memory reclamation for hybridkv
//!
//! Unlike crossbeam-epoch's automatic, opaque epoch scheme, the hybrid log
//! needs explicit numbered epochs: a page cannot be evicted, and a checkpoint
//! cannot complete, until every thread that might still be touching the
//! affected address range has crossed a specific epoch boundary. This module
//! is a from-scratch slot table modeled on FASTER's `LightEpoch`
//! (`Acquire`/`Refresh`/`BumpAndSuspend`/`BumpEpoch`), reworked into safe Rust.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Epoch value meaning "this slot is not currently protecting anything".
const UNPROTECTED: u64 = 0;

/// Maximum number of concurrently registered threads/sessions.
const MAX_SLOTS: usize = 256;

/// A deferred action, run once the global safe epoch passes `trigger_epoch`.
struct DeferredAction {
    trigger_epoch: u64,
    action: Box<dyn FnOnce() + Send>,
}

/// Per-thread/session epoch slot. Returned by `EpochManager::acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSlot(usize);

/// Numbered-epoch manager.
///
/// Each registered slot either holds `UNPROTECTED` (not touching any
/// epoch-sensitive structure) or the epoch it last refreshed to. The global
/// safe epoch is the minimum protected value across all slots, or the current
/// epoch if no slot is protecting anything. Deferred actions whose trigger
/// epoch is `<= safe_epoch` are safe to run: every thread that could have
/// observed the pre-bump state has since refreshed past it.
pub struct EpochManager {
    current_epoch: AtomicU64,
    safe_epoch: AtomicU64,
    slots: Vec<AtomicU64>,
    slot_in_use: Vec<AtomicUsize>,
    deferred: Mutex<Vec<DeferredAction>>,
}

impl EpochManager {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SLOTS);
        let mut slot_in_use = Vec::with_capacity(MAX_SLOTS);
        for _ in 0..MAX_SLOTS {
            slots.push(AtomicU64::new(UNPROTECTED));
            slot_in_use.push(AtomicUsize::new(0));
        }
        Self {
            current_epoch: AtomicU64::new(1),
            safe_epoch: AtomicU64::new(1),
            slots,
            slot_in_use,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Register a new thread/session, returning a slot handle. The slot
    /// starts unprotected; call `refresh` before touching epoch-sensitive
    /// state.
    pub fn acquire(&self) -> EpochSlot {
        for (idx, in_use) in self.slot_in_use.iter().enumerate() {
            if in_use
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.slots[idx].store(UNPROTECTED, Ordering::Release);
                return EpochSlot(idx);
            }
        }
        panic!("hybridkv: epoch slot table exhausted (max {MAX_SLOTS} concurrent sessions)");
    }

    /// Release a slot back to the pool. Callers must not be holding a
    /// protected epoch (i.e. call `bump_and_suspend` first).
    pub fn release(&self, slot: EpochSlot) {
        self.slots[slot.0].store(UNPROTECTED, Ordering::Release);
        self.slot_in_use[slot.0].store(0, Ordering::Release);
    }

    /// Current global epoch counter.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Most recently computed safe epoch: every slot has refreshed to at
    /// least this value (or is unprotected).
    pub fn safe_epoch(&self) -> u64 {
        self.safe_epoch.load(Ordering::Acquire)
    }

    /// Mark `slot` as protecting the current epoch. Must be called before
    /// accessing epoch-sensitive structures (the page buffer, the hash
    /// index) and periodically thereafter so the safe epoch can advance.
    pub fn refresh(&self, slot: EpochSlot) -> u64 {
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.slots[slot.0].store(epoch, Ordering::Release);
        self.compute_safe_epoch();
        epoch
    }

    /// Mark `slot` as unprotected (suspended), then attempt to bump the
    /// global epoch and drain any deferred actions now safe to run.
    /// Mirrors FASTER's `BumpAndSuspend`.
    pub fn bump_and_suspend(&self, slot: EpochSlot) {
        self.slots[slot.0].store(UNPROTECTED, Ordering::Release);
        self.bump_epoch();
    }

    /// Advance the global epoch by one and recompute the safe epoch,
    /// draining any deferred actions that are now safe to run.
    pub fn bump_epoch(&self) -> u64 {
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.compute_safe_epoch();
        self.drain_deferred();
        new_epoch
    }

    /// Recompute the safe epoch as the minimum protected slot value, or the
    /// current epoch if nothing is currently protected.
    fn compute_safe_epoch(&self) {
        let current = self.current_epoch.load(Ordering::Acquire);
        let mut min_protected = current;
        for (idx, in_use) in self.slot_in_use.iter().enumerate() {
            if in_use.load(Ordering::Acquire) == 0 {
                continue;
            }
            let value = self.slots[idx].load(Ordering::Acquire);
            if value != UNPROTECTED && value < min_protected {
                min_protected = value;
            }
        }
        // Safe epoch only ever advances.
        let mut prev = self.safe_epoch.load(Ordering::Acquire);
        while min_protected > prev {
            match self.safe_epoch.compare_exchange_weak(
                prev,
                min_protected,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Defer `action` until the global epoch has advanced past `epoch` and
    /// every thread has refreshed past it (i.e. until `safe_epoch() > epoch`).
    /// Used to free evicted pages and reclaim stale index slots only after
    /// no in-flight reader could still observe them.
    pub fn defer_until<F>(&self, epoch: u64, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.safe_epoch.load(Ordering::Acquire) > epoch {
            action();
            return;
        }
        self.deferred.lock().push(DeferredAction {
            trigger_epoch: epoch,
            action: Box::new(action),
        });
    }

    /// Run every deferred action whose trigger epoch is now behind the safe
    /// epoch.
    fn drain_deferred(&self) {
        let safe = self.safe_epoch.load(Ordering::Acquire);
        let mut ready = Vec::new();
        {
            let mut deferred = self.deferred.lock();
            let mut i = 0;
            while i < deferred.len() {
                if deferred[i].trigger_epoch <= safe {
                    ready.push(deferred.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for item in ready {
            (item.action)();
        }
    }

    /// Number of deferred actions still waiting on a future safe epoch.
    pub fn pending_deferred(&self) -> usize {
        self.deferred.lock().len()
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared epoch manager used across sessions and background tasks.
pub type SharedEpochManager = Arc<EpochManager>;

pub fn new_shared_epoch_manager() -> SharedEpochManager {
    Arc::new(EpochManager::new())
}
