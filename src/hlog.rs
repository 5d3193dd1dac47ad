//! Hybrid Log (HLog) implementation for hybridkv
//!
//! This module implements the core storage engine inspired by FASTER's
//! PersistentMemoryMalloc: a large, in-memory ring of pages backed by a
//! pluggable device, split into four address regions by three monotonic
//! boundaries (`begin_address <= head_address <= read_only_address <=
//! tail_address`). Combines the Page Buffer and Hybrid Log Allocator
//! components.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::common::{Address, INVALID_ADDRESS, Key, RecordInfo, Result, RsKvError, Value, get_offset, get_page, make_address};
use crate::device::Device;
use crate::epoch::SharedEpochManager;

/// Lifecycle of a single page in the in-memory ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// No backing memory allocated yet.
    Unallocated,
    /// Backed by memory, open for both reads and in-place writes.
    Allocated,
    /// `ReadOnlyAddress` has passed this page: no more in-place writes, only
    /// reads, pending flush.
    ClosedForWrites,
    /// A flush to the device has been issued for this page.
    FlushSubmitted,
    /// The device holds a durable copy of this page's contents.
    Flushed,
    /// `HeadAddress` has passed this page: memory has been freed.
    Evicted,
}

/// Record stored in the hybrid log (the serialized form written to pages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub header: RecordInfo,
    pub key: Key,
    pub value: Value,
}

impl LogRecord {
    pub fn new(key: Key, value: Value, previous_address: Address, checkpoint_version: u32) -> Self {
        Self {
            header: RecordInfo::new(previous_address, checkpoint_version, false),
            key,
            value,
        }
    }

    pub fn tombstone(key: Key, previous_address: Address, checkpoint_version: u32) -> Self {
        Self {
            header: RecordInfo::new(previous_address, checkpoint_version, true),
            key,
            value: Vec::new(),
        }
    }

    pub fn serialized_size(&self) -> u32 {
        bincode::serialized_size(self).unwrap_or(0) as u32
    }
}

/// The hybrid log: a ring of in-memory pages over a pluggable device.
pub struct HybridLog {
    pages: Vec<RwLock<Option<Box<[u8]>>>>,
    page_status: Vec<RwLock<PageStatus>>,

    page_bits: u32,
    page_size: u64,
    buffer_pages: u64,

    /// [begin_address, head_address): on device only.
    begin_address: AtomicU64,
    /// [head_address, read_only_address): in memory, read-only.
    head_address: AtomicU64,
    /// [read_only_address, tail_address): in memory, mutable.
    read_only_address: AtomicU64,
    /// Tail of the log; new allocations happen here.
    tail_address: AtomicU64,

    epoch: SharedEpochManager,
    device: Arc<Mutex<Box<dyn Device + Send + Sync>>>,

    /// Highest address durably written to the device.
    flushed_until_address: AtomicU64,
}

impl HybridLog {
    pub fn new(
        memory_size: u64,
        page_bits: u32,
        device: Box<dyn Device + Send + Sync>,
        epoch: SharedEpochManager,
    ) -> Result<Self> {
        let page_size = 1u64 << page_bits;
        let buffer_pages = (memory_size / page_size).max(2);

        if buffer_pages == 0 {
            return Err(RsKvError::InvalidConfig {
                message: "memory size too small for at least one page".to_string(),
            });
        }

        let mut pages = Vec::with_capacity(buffer_pages as usize);
        let mut page_status = Vec::with_capacity(buffer_pages as usize);
        for _ in 0..buffer_pages {
            pages.push(RwLock::new(None));
            page_status.push(RwLock::new(PageStatus::Unallocated));
        }

        // Page 0 is skipped: address 0 means "invalid" (INVALID_ADDRESS), so
        // the log starts allocating from page 1.
        let start_address = make_address(1, 0, page_bits);

        let hlog = Self {
            pages,
            page_status,
            page_bits,
            page_size,
            buffer_pages,
            begin_address: AtomicU64::new(start_address),
            head_address: AtomicU64::new(start_address),
            read_only_address: AtomicU64::new(start_address),
            tail_address: AtomicU64::new(start_address),
            epoch,
            device: Arc::new(Mutex::new(device)),
            flushed_until_address: AtomicU64::new(start_address),
        };

        hlog.allocate_page(get_page(start_address, page_bits))?;
        Ok(hlog)
    }

    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    fn page_index(&self, page: u64) -> usize {
        (page % self.buffer_pages) as usize
    }

    /// Allocate space in the log for a record of the given size, returning
    /// the address to write it at. Returns `Err(NeedsRefresh)` if the
    /// in-memory ring has no free pages left (caller must drive a
    /// `ShiftReadOnlyAddress`/`ShiftHeadAddress` cycle and retry).
    pub fn allocate(&self, size: u32) -> Result<Address> {
        if size == 0 || u64::from(size) > self.page_size {
            return Err(RsKvError::AllocationFailed { size });
        }

        loop {
            let old_tail = self.tail_address.fetch_add(size as u64, Ordering::AcqRel);
            let old_page = get_page(old_tail, self.page_bits);
            let old_offset = get_offset(old_tail, self.page_bits);
            let new_offset = old_offset + size as u64;

            if new_offset <= self.page_size {
                self.ensure_capacity(old_page)?;
                return Ok(old_tail);
            }

            // Crossed a page boundary: roll forward to the next page start.
            let new_page = old_page + 1;
            let new_page_start = make_address(new_page, 0, self.page_bits);
            let target = new_page_start + size as u64;

            match self.tail_address.compare_exchange(
                old_tail + size as u64,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.ensure_capacity(new_page)?;
                    return Ok(new_page_start);
                }
                Err(_) => continue,
            }
        }
    }

    fn ensure_capacity(&self, page: u64) -> Result<()> {
        if page - get_page(self.head_address.load(Ordering::Acquire), self.page_bits) >= self.buffer_pages {
            return Err(RsKvError::NeedsRefresh);
        }
        self.allocate_page(page)
    }

    fn allocate_page(&self, page: u64) -> Result<()> {
        let idx = self.page_index(page);
        let mut page_guard = self.pages[idx].write();
        if page_guard.is_none() {
            *page_guard = Some(vec![0u8; self.page_size as usize].into_boxed_slice());
            *self.page_status[idx].write() = PageStatus::Allocated;
        }
        Ok(())
    }

    /// Serialize and append `record` at the tail. Always an append, never an
    /// in-place write, so invariant I2 never applies here.
    pub fn insert_record(&self, record: &LogRecord) -> Result<Address> {
        let serialized = bincode::serialize(record)?;
        let size = serialized.len() as u32;
        let address = self.allocate(size)?;
        self.write_bytes(address, &serialized, true)?;
        Ok(address)
    }

    /// Overwrite the record at `address` in place. Only legal for addresses
    /// in the mutable region (invariant I2); callers must have already
    /// checked `address >= read_only_address()` under an index CAS.
    pub fn update_record_in_place(&self, address: Address, record: &LogRecord) -> Result<()> {
        let serialized = bincode::serialize(record)?;
        self.write_bytes(address, &serialized, false)
    }

    fn write_bytes(&self, address: Address, data: &[u8], is_append: bool) -> Result<()> {
        if !is_append && address < self.read_only_address.load(Ordering::Acquire) {
            return Err(RsKvError::Internal {
                message: format!(
                    "refusing in-place write at 0x{address:x} below read-only boundary"
                ),
            });
        }

        let page = get_page(address, self.page_bits);
        let offset = get_offset(address, self.page_bits) as usize;
        if offset + data.len() > self.page_size as usize {
            return Err(RsKvError::AllocationFailed {
                size: data.len() as u32,
            });
        }

        let idx = self.page_index(page);
        let mut page_guard = self.pages[idx].write();
        match page_guard.as_mut() {
            Some(page_data) => {
                page_data[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            None => Err(RsKvError::AddressOutOfBounds { address }),
        }
    }

    /// Look up a record. Returns `Err(PendingIo)` if the address has already
    /// been evicted from memory and must be serviced from the device (the
    /// caller — the operation engine — performs that read and resumes).
    pub fn read_record(&self, address: Address) -> Result<LogRecord> {
        if address < self.begin_address.load(Ordering::Acquire) {
            return Err(RsKvError::KeyNotFound);
        }
        if address < self.head_address.load(Ordering::Acquire) {
            return Err(RsKvError::PendingIo);
        }

        let raw = self
            .read_in_memory(address)
            .ok_or(RsKvError::AddressOutOfBounds { address })?;
        bincode::deserialize(&raw).map_err(RsKvError::Serialization)
    }

    /// Service a `PendingIo` by reading the record directly from the device.
    /// Called from the session's `complete_pending` drain loop.
    pub fn read_record_from_device(&self, address: Address) -> Result<LogRecord> {
        const INITIAL_READ_SIZE: usize = 1024;
        const MAX_RECORD_SIZE: usize = 64 * 1024;

        let device = self.device.lock();
        let mut buffer = vec![0u8; INITIAL_READ_SIZE];
        let bytes_read = device.read_page(address, &mut buffer)?;
        if bytes_read == 0 {
            return Err(RsKvError::AddressOutOfBounds { address });
        }

        match bincode::deserialize::<LogRecord>(&buffer[..bytes_read]) {
            Ok(record) => Ok(record),
            Err(_) => {
                let mut large_buffer = vec![0u8; MAX_RECORD_SIZE];
                let bytes_read = device.read_page(address, &mut large_buffer)?;
                if bytes_read == 0 {
                    return Err(RsKvError::AddressOutOfBounds { address });
                }
                bincode::deserialize(&large_buffer[..bytes_read]).map_err(RsKvError::Serialization)
            }
        }
    }

    /// Scan records directly from the device between `begin` (inclusive) and
    /// `end` (exclusive), invoking `f` with each record's address and decoded
    /// contents. Used to rebuild the index after a checkpoint that did not
    /// persist an index snapshot (`CheckpointKind::FuzzyLog`).
    pub fn scan_device_records(
        &self,
        begin: Address,
        end: Address,
        mut f: impl FnMut(Address, LogRecord),
    ) -> Result<()> {
        let mut address = begin;
        while address < end {
            let record = self.read_record_from_device(address)?;
            let size = record.serialized_size() as u64;
            if size == 0 {
                break;
            }

            let page = get_page(address, self.page_bits);
            let offset = get_offset(address, self.page_bits);
            let next_offset = offset + size;
            let next_address = if next_offset <= self.page_size {
                address + size
            } else {
                make_address(page + 1, 0, self.page_bits)
            };

            f(address, record);

            if next_address <= address {
                break;
            }
            address = next_address;
        }
        Ok(())
    }

    fn read_in_memory(&self, address: Address) -> Option<Vec<u8>> {
        let page = get_page(address, self.page_bits);
        let offset = get_offset(address, self.page_bits) as usize;
        let idx = self.page_index(page);
        let page_guard = self.pages[idx].read();
        page_guard.as_ref().and_then(|data| {
            if offset < data.len() {
                Some(data[offset..].to_vec())
            } else {
                None
            }
        })
    }

    /// Shift `ReadOnlyAddress` to the current tail, freezing the mutable
    /// region into read-only. Marks now-closed pages `ClosedForWrites`.
    pub fn shift_read_only_address(&self) -> Address {
        let tail = self.tail_address.load(Ordering::Acquire);
        let old_ro = self.read_only_address.swap(tail, Ordering::AcqRel);

        let old_page = get_page(old_ro, self.page_bits);
        let new_page = get_page(tail, self.page_bits);
        for page in old_page..new_page {
            let idx = self.page_index(page);
            let mut status = self.page_status[idx].write();
            if *status == PageStatus::Allocated {
                *status = PageStatus::ClosedForWrites;
            }
        }

        log::debug!("shifted read-only address from 0x{old_ro:x} to 0x{tail:x}");
        old_ro
    }

    /// Flush every page between `flushed_until_address` and `until_address`
    /// to the device.
    pub async fn flush_to_disk(&self, until_address: Address) -> Result<()> {
        let current_flushed = self.flushed_until_address.load(Ordering::Acquire);
        if until_address <= current_flushed {
            return Ok(());
        }

        let start_page = get_page(current_flushed, self.page_bits);
        let end_page = get_page(until_address.saturating_sub(1), self.page_bits);

        for page in start_page..=end_page {
            self.flush_page_to_disk(page).await?;
        }

        self.flushed_until_address
            .store(until_address, Ordering::Release);
        self.device.lock().flush()?;
        log::debug!("flush completed to address 0x{until_address:x}");
        Ok(())
    }

    async fn flush_page_to_disk(&self, page: u64) -> Result<()> {
        let idx = self.page_index(page);

        let page_data = {
            let status_guard = self.page_status[idx].read();
            if *status_guard != PageStatus::ClosedForWrites && *status_guard != PageStatus::Allocated {
                return Ok(());
            }
            let page_guard = self.pages[idx].read();
            match page_guard.as_ref() {
                Some(data) => data.clone(),
                None => return Ok(()),
            }
        };

        *self.page_status[idx].write() = PageStatus::FlushSubmitted;

        let disk_offset = page * self.page_size;
        self.device.lock().write_page(disk_offset, &page_data)?;

        *self.page_status[idx].write() = PageStatus::Flushed;
        log::trace!("flushed page {page} to device at offset 0x{disk_offset:x}");
        Ok(())
    }

    /// Advance `HeadAddress`, evicting now-flushed pages from memory. The
    /// actual free is deferred through the epoch manager at `trigger_epoch`
    /// so no in-flight reader observes a torn page.
    pub fn shift_head_address(&self, new_head_address: Address, trigger_epoch: u64) -> Result<()> {
        let old_head = self.head_address.swap(new_head_address, Ordering::AcqRel);

        let old_page = get_page(old_head, self.page_bits);
        let new_page = get_page(new_head_address, self.page_bits);

        for page in old_page..new_page {
            let idx = self.page_index(page);
            {
                let status = self.page_status[idx].read();
                if *status != PageStatus::Flushed {
                    continue;
                }
            }
            let epoch = self.epoch.clone();
            // Evict lazily: capture the page slot by index, not by raw
            // pointer, since the Vec itself is long-lived for the store's
            // whole lifetime.
            let pages_ptr: *const RwLock<Option<Box<[u8]>>> = &self.pages[idx];
            let status_ptr: *const RwLock<PageStatus> = &self.page_status[idx];
            // SAFETY: both pointers point into `self.pages`/`self.page_status`,
            // which outlive the store and are never reallocated (fixed-size
            // ring), so the deferred closure may dereference them once the
            // epoch manager judges it safe.
            let pages_addr = pages_ptr as usize;
            let status_addr = status_ptr as usize;
            epoch.defer_until(trigger_epoch, move || {
                let pages = unsafe { &*(pages_addr as *const RwLock<Option<Box<[u8]>>>) };
                let status = unsafe { &*(status_addr as *const RwLock<PageStatus>) };
                *pages.write() = None;
                *status.write() = PageStatus::Evicted;
            });
        }

        log::debug!("shifted head address from 0x{old_head:x} to 0x{new_head_address:x}");
        Ok(())
    }

    /// Advance `BeginAddress`, permanently reclaiming device space below it.
    pub fn advance_begin_address(&self, new_begin_address: Address) -> Result<u64> {
        let old_begin = self.begin_address.swap(new_begin_address, Ordering::AcqRel);
        if new_begin_address <= old_begin {
            return Ok(0);
        }
        let bytes_reclaimed = new_begin_address - old_begin;

        {
            let mut device = self.device.lock();
            if !device.supports_mmap() {
                self.compact_device(&mut **device, old_begin, new_begin_address)?;
            }
        }

        log::info!(
            "advanced begin address from 0x{old_begin:x} to 0x{new_begin_address:x}, reclaimed {bytes_reclaimed} bytes"
        );
        Ok(bytes_reclaimed)
    }

    fn compact_device(&self, device: &mut dyn Device, old_begin: Address, new_begin: Address) -> Result<()> {
        const BUFFER_SIZE: usize = 1024 * 1024;
        let mut buffer = vec![0u8; BUFFER_SIZE];

        let total_size = device.size();
        if new_begin >= total_size {
            device.truncate(0)?;
            return Ok(());
        }

        let mut read_offset = new_begin;
        let mut write_offset = 0u64;
        while read_offset < total_size {
            let to_read = BUFFER_SIZE.min((total_size - read_offset) as usize);
            let bytes_read = device.read_page(read_offset, &mut buffer[..to_read])?;
            if bytes_read == 0 {
                break;
            }
            device.write_page(write_offset, &buffer[..bytes_read])?;
            read_offset += bytes_read as u64;
            write_offset += bytes_read as u64;
        }

        device.truncate(total_size - (new_begin - old_begin))?;
        device.flush()?;
        Ok(())
    }

    pub fn tail_address(&self) -> Address {
        self.tail_address.load(Ordering::Acquire)
    }

    pub fn head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    pub fn read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    pub fn begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.read_only_address.load(Ordering::Acquire)
    }

    /// Re-point every address boundary after recovering from a checkpoint.
    /// The region `[begin, tail)` is treated as durable-on-device-only (no
    /// page is resident in memory yet); reads below `tail` resolve via
    /// `PendingIo` and fall through to `read_record_from_device`, which
    /// reads the preserved log file directly. New writes continue appending
    /// after `tail`.
    pub fn restore_addresses(&self, begin: Address, tail: Address) {
        self.begin_address.store(begin, Ordering::Release);
        self.head_address.store(tail, Ordering::Release);
        self.read_only_address.store(tail, Ordering::Release);
        self.tail_address.store(tail, Ordering::Release);
        self.flushed_until_address.store(tail, Ordering::Release);
        log::info!("restored hybrid log addresses: begin=0x{begin:x} tail=0x{tail:x}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::new_shared_epoch_manager;
    use tempfile::tempdir;

    struct MockDevice {
        data: Vec<u8>,
    }

    impl MockDevice {
        fn new() -> Self {
            Self { data: Vec::new() }
        }
    }

    impl Device for MockDevice {
        fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            let end = offset as usize + data.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        fn read_page(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let start = offset as usize;
            if start >= self.data.len() {
                return Ok(0);
            }
            let end = (start + buf.len()).min(self.data.len());
            let n = end - start;
            buf[..n].copy_from_slice(&self.data[start..end]);
            Ok(n)
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn truncate(&mut self, size: u64) -> Result<()> {
            self.data.truncate(size as usize);
            Ok(())
        }
    }

    fn test_log(memory_size: u64) -> HybridLog {
        HybridLog::new(memory_size, 16, Box::new(MockDevice::new()), new_shared_epoch_manager()).unwrap()
    }

    #[test]
    fn test_allocation_distinct_addresses() {
        let hlog = test_log(1 << 20);
        let a = hlog.allocate(64).unwrap();
        let b = hlog.allocate(64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_insert_and_read_record() {
        let hlog = test_log(1 << 20);
        let record = LogRecord::new(b"k".to_vec(), b"v".to_vec(), INVALID_ADDRESS, 0);
        let address = hlog.insert_record(&record).unwrap();
        let read_back = hlog.read_record(address).unwrap();
        assert_eq!(read_back.key, b"k".to_vec());
        assert_eq!(read_back.value, b"v".to_vec());
    }

    #[test]
    fn test_in_place_update_rejected_below_read_only() {
        let hlog = test_log(1 << 20);
        let record = LogRecord::new(b"k".to_vec(), b"v1".to_vec(), INVALID_ADDRESS, 0);
        let address = hlog.insert_record(&record).unwrap();

        hlog.shift_read_only_address();

        let updated = LogRecord::new(b"k".to_vec(), b"v2".to_vec(), INVALID_ADDRESS, 0);
        assert!(hlog.update_record_in_place(address, &updated).is_err());
    }

    #[test]
    fn test_page_crossing_allocation() {
        let hlog = test_log(1 << 20);
        // page size is 2^16 = 64KiB; force a boundary crossing.
        let _ = hlog.allocate(60_000).unwrap();
        let second = hlog.allocate(60_000).unwrap();
        assert_eq!(get_offset(second, 16), 0);
    }

    #[tokio::test]
    async fn test_flush_to_disk() {
        let hlog = test_log(1 << 20);
        let record = LogRecord::new(b"k".to_vec(), b"v".to_vec(), INVALID_ADDRESS, 0);
        let _ = hlog.insert_record(&record).unwrap();
        hlog.shift_read_only_address();
        let tail = hlog.tail_address();
        hlog.flush_to_disk(tail).await.unwrap();
        assert_eq!(hlog.flushed_until_address(), tail);
    }

    #[test]
    fn test_file_system_disk_via_device_mod() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hlog.log");
        let device = crate::device::FileSystemDisk::new(&path).unwrap();
        assert_eq!(device.size(), 0);
    }
}
