//! Concurrent hash index (C5) for hybridkv
//!
//! A fixed-size, open-addressed hash table over cache-line-sized buckets,
//! following FASTER's hash bucket layout: each bucket holds seven packed
//! 64-bit entries (16-bit tag, 1 tentative bit, 47-bit address) plus one
//! overflow pointer, so a bucket is exactly one cache line. Collisions on
//! a bucket's tag space spill into a pool of overflow buckets rather than
//! growing the primary table — the index never resizes (a Non-goal).
//!
//! The bucket stores only the *head* address of a key's version chain; the
//! rest of the chain lives in the log via `RecordInfo::previous_address`
//! (invariant I1). Distinct keys that hash to the same tag are disambiguated
//! by the operation engine walking the chain and comparing full keys.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ahash::AHasher;

use crate::common::{Address, INVALID_ADDRESS, Result, RsKvError, TAG_BITS};

/// Hashes keys for both bucket selection and the tag stored in each slot.
pub struct KeyHasher;

impl KeyHasher {
    pub fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = AHasher::default();
        hasher.write(key);
        hasher.finish()
    }
}

const ADDRESS_BITS: u32 = 47;
const ADDRESS_MASK: u64 = (1u64 << ADDRESS_BITS) - 1;
const TENTATIVE_BIT: u64 = 1u64 << ADDRESS_BITS;
const TAG_SHIFT: u32 = ADDRESS_BITS + 1;
const TAG_MASK: u64 = (1u64 << TAG_BITS) - 1;

const ENTRIES_PER_BUCKET: usize = 7;

#[inline]
fn pack(tag: u16, tentative: bool, address: Address) -> u64 {
    debug_assert!(address <= ADDRESS_MASK, "address does not fit in 47 bits");
    (address & ADDRESS_MASK)
        | if tentative { TENTATIVE_BIT } else { 0 }
        | ((tag as u64 & TAG_MASK) << TAG_SHIFT)
}

#[inline]
fn unpack_tag(word: u64) -> u16 {
    ((word >> TAG_SHIFT) & TAG_MASK) as u16
}

#[inline]
fn unpack_tentative(word: u64) -> bool {
    word & TENTATIVE_BIT != 0
}

#[inline]
fn unpack_address(word: u64) -> Address {
    word & ADDRESS_MASK
}

/// A single cache-line-sized hash bucket: 7 resident slots plus one
/// overflow-chain pointer (1-indexed into the overflow pool; 0 = none).
#[repr(align(64))]
struct HashBucket {
    entries: [AtomicU64; ENTRIES_PER_BUCKET],
    overflow: AtomicU64,
}

impl HashBucket {
    fn empty() -> Self {
        Self {
            entries: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
        }
    }
}

/// Outcome of a tag-collision probe within one bucket.
enum Probe {
    /// Slot index holds a matching, non-tentative tag.
    Found(usize),
    /// Slot index is empty (address == INVALID_ADDRESS) and can be claimed.
    Empty(usize),
    /// No matching or empty slot in this bucket; caller must look at
    /// the overflow chain (or allocate one).
    Full,
}

fn probe_bucket(bucket: &HashBucket, tag: u16) -> Probe {
    let mut empty_slot = None;
    for (i, slot) in bucket.entries.iter().enumerate() {
        let word = slot.load(Ordering::Acquire);
        if word == 0 {
            if empty_slot.is_none() {
                empty_slot = Some(i);
            }
            continue;
        }
        if unpack_tag(word) == tag && !unpack_tentative(word) {
            return Probe::Found(i);
        }
    }
    match empty_slot {
        Some(i) => Probe::Empty(i),
        None => Probe::Full,
    }
}

/// Fixed-capacity hash index mapping `(key hash)` to the head address of
/// that key's version chain.
pub struct HashIndex {
    buckets: Vec<HashBucket>,
    mask: u64,
    overflow_pool: Vec<HashBucket>,
    overflow_next: AtomicUsize,
    entry_count: AtomicUsize,
}

impl HashIndex {
    /// `num_buckets` must be a power of two (enforced by `Config::validate`).
    pub fn new(num_buckets: u64) -> Self {
        let buckets = (0..num_buckets).map(|_| HashBucket::empty()).collect();
        // Overflow pool sized generously relative to the primary table; real
        // workloads should see few spills if keys hash uniformly.
        let overflow_capacity = (num_buckets / 4).max(16) as usize;
        let overflow_pool = (0..overflow_capacity).map(|_| HashBucket::empty()).collect();

        Self {
            buckets,
            mask: num_buckets - 1,
            overflow_pool,
            overflow_next: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
        }
    }

    fn bucket_for(&self, key_hash: u64) -> &HashBucket {
        &self.buckets[(key_hash & self.mask) as usize]
    }

    fn tag_for(key_hash: u64) -> u16 {
        (key_hash >> 48) as u16
    }

    fn allocate_overflow_bucket(&self) -> Result<usize> {
        let idx = self.overflow_next.fetch_add(1, Ordering::AcqRel);
        if idx >= self.overflow_pool.len() {
            self.overflow_next.fetch_sub(1, Ordering::AcqRel);
            return Err(RsKvError::IndexSaturated);
        }
        Ok(idx)
    }

    /// Look up the current head address for `key_hash`. `None` means no
    /// record has ever been written for this tag.
    pub fn find(&self, key_hash: u64) -> Option<Address> {
        let tag = Self::tag_for(key_hash);
        let mut bucket = self.bucket_for(key_hash);

        loop {
            if let Probe::Found(i) = probe_bucket(bucket, tag) {
                let word = bucket.entries[i].load(Ordering::Acquire);
                return Some(unpack_address(word));
            }
            let overflow = bucket.overflow.load(Ordering::Acquire);
            if overflow == 0 {
                return None;
            }
            bucket = &self.overflow_pool[(overflow - 1) as usize];
        }
    }

    /// Install `new_address` as the head address for `key_hash`, returning
    /// the previous head address (`INVALID_ADDRESS` if this tag was unclaimed).
    /// Used by Upsert/RMW/Delete after a new tail record has been written
    /// with `previous_address` set to the value this call returns.
    pub fn update(&self, key_hash: u64, new_address: Address) -> Result<Address> {
        let tag = Self::tag_for(key_hash);
        let mut bucket = self.bucket_for(key_hash);

        loop {
            match probe_bucket(bucket, tag) {
                Probe::Found(i) => {
                    let slot = &bucket.entries[i];
                    loop {
                        let current = slot.load(Ordering::Acquire);
                        let new_word = pack(tag, false, new_address);
                        match slot.compare_exchange(
                            current,
                            new_word,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => return Ok(unpack_address(current)),
                            Err(actual) if unpack_tag(actual) == tag => continue,
                            Err(_) => break, // raced with a different tag claiming this slot
                        }
                    }
                }
                Probe::Empty(i) => {
                    let slot = &bucket.entries[i];
                    let new_word = pack(tag, false, new_address);
                    if slot
                        .compare_exchange(0, new_word, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.entry_count.fetch_add(1, Ordering::Relaxed);
                        return Ok(INVALID_ADDRESS);
                    }
                    // Slot got claimed concurrently; re-probe the same bucket.
                }
                Probe::Full => {
                    let overflow = bucket.overflow.load(Ordering::Acquire);
                    if overflow != 0 {
                        bucket = &self.overflow_pool[(overflow - 1) as usize];
                        continue;
                    }
                    let new_idx = self.allocate_overflow_bucket()?;
                    match bucket.overflow.compare_exchange(
                        0,
                        (new_idx + 1) as u64,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => bucket = &self.overflow_pool[new_idx],
                        Err(existing) => bucket = &self.overflow_pool[(existing - 1) as usize],
                    }
                }
            }
        }
    }

    /// Conditionally replace the head address only if it still equals
    /// `expected`. Used by in-place Upsert/RMW to install a new tail address
    /// without losing a concurrent writer's update.
    pub fn compare_and_update(&self, key_hash: u64, expected: Address, new_address: Address) -> bool {
        let tag = Self::tag_for(key_hash);
        let mut bucket = self.bucket_for(key_hash);

        loop {
            match probe_bucket(bucket, tag) {
                Probe::Found(i) => {
                    let slot = &bucket.entries[i];
                    let current = slot.load(Ordering::Acquire);
                    if unpack_address(current) != expected {
                        return false;
                    }
                    let new_word = pack(tag, false, new_address);
                    return slot
                        .compare_exchange(current, new_word, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                }
                Probe::Empty(i) => {
                    if expected != INVALID_ADDRESS {
                        return false;
                    }
                    let slot = &bucket.entries[i];
                    let new_word = pack(tag, false, new_address);
                    match slot.compare_exchange(0, new_word, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {
                            self.entry_count.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                        Err(_) => continue, // slot claimed concurrently, re-probe the bucket
                    }
                }
                Probe::Full => {
                    let overflow = bucket.overflow.load(Ordering::Acquire);
                    if overflow == 0 {
                        if expected != INVALID_ADDRESS {
                            return false;
                        }
                        let new_idx = match self.allocate_overflow_bucket() {
                            Ok(idx) => idx,
                            Err(_) => return false,
                        };
                        bucket = match bucket.overflow.compare_exchange(
                            0,
                            (new_idx + 1) as u64,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => &self.overflow_pool[new_idx],
                            Err(existing) => &self.overflow_pool[(existing - 1) as usize],
                        };
                        continue;
                    }
                    bucket = &self.overflow_pool[(overflow - 1) as usize];
                }
            }
        }
    }

    /// Number of distinct tags currently claimed (approximate; not every
    /// claimed tag corresponds to exactly one live key under collisions).
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore a slot directly into a specific bucket (used by checkpoint
    /// recovery, which persists `(bucket_index, tag, address)` triples so it
    /// doesn't need to recompute key hashes).
    pub fn restore_raw(&self, bucket_index: u64, tag: u16, address: Address) -> Result<()> {
        let bucket = &self.buckets[(bucket_index & self.mask) as usize];
        match probe_bucket(bucket, tag) {
            Probe::Found(i) | Probe::Empty(i) => {
                bucket.entries[i].store(pack(tag, false, address), Ordering::Release);
                self.entry_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Probe::Full => {
                let overflow = bucket.overflow.load(Ordering::Acquire);
                let target = if overflow != 0 {
                    &self.overflow_pool[(overflow - 1) as usize]
                } else {
                    let idx = self.allocate_overflow_bucket()?;
                    bucket
                        .overflow
                        .store((idx + 1) as u64, Ordering::Release);
                    &self.overflow_pool[idx]
                };
                match probe_bucket(target, tag) {
                    Probe::Found(i) | Probe::Empty(i) => {
                        target.entries[i].store(pack(tag, false, address), Ordering::Release);
                        self.entry_count.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Probe::Full => Err(RsKvError::IndexSaturated),
                }
            }
        }
    }

    /// `(bucket_index, tag, address)` triples for every occupied primary
    /// bucket slot, used by index-only checkpoints to avoid rehashing keys
    /// on recovery.
    pub fn snapshot_raw(&self) -> Vec<(u64, u16, Address)> {
        let mut out = Vec::new();
        for (bucket_idx, bucket) in self.buckets.iter().enumerate() {
            for slot in bucket.entries.iter() {
                let word = slot.load(Ordering::Acquire);
                if word != 0 && !unpack_tentative(word) {
                    out.push((bucket_idx as u64, unpack_tag(word), unpack_address(word)));
                }
            }
        }
        out
    }

    pub fn clear(&self) {
        for bucket in &self.buckets {
            for slot in &bucket.entries {
                slot.store(0, Ordering::Release);
            }
            bucket.overflow.store(0, Ordering::Release);
        }
        self.overflow_next.store(0, Ordering::Release);
        self.entry_count.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexMemoryStats {
    pub num_buckets: u64,
    pub overflow_buckets_used: usize,
    pub overflow_buckets_total: usize,
    pub entry_count: usize,
    pub memory_bytes: usize,
}

impl HashIndex {
    pub fn memory_stats(&self) -> IndexMemoryStats {
        let overflow_buckets_used = self.overflow_next.load(Ordering::Acquire).min(self.overflow_pool.len());
        IndexMemoryStats {
            num_buckets: self.buckets.len() as u64,
            overflow_buckets_used,
            overflow_buckets_total: self.overflow_pool.len(),
            entry_count: self.len(),
            memory_bytes: (self.buckets.len() + self.overflow_pool.len()) * std::mem::size_of::<HashBucket>(),
        }
    }
}

pub type SharedHashIndex = std::sync::Arc<HashIndex>;

pub fn new_shared_hash_index(num_buckets: u64) -> SharedHashIndex {
    std::sync::Arc::new(HashIndex::new(num_buckets))
}
