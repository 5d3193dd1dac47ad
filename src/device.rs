//! Pluggable storage device abstraction for hybridkv
//!
//! Mirrors the teacher's `StorageDevice` trait in `hlog.rs`, pulled into its
//! own module so the hybrid log allocator can depend on the abstraction
//! without owning a concrete backend. A synchronous `Write`/`Read` trait
//! (the hot path already holds page locks, so there is nothing to gain from
//! `async fn` here) plus two implementations: a plain file and an optional
//! memory-mapped file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::common::Result;

/// Storage device trait for abstracting disk I/O operations.
pub trait Device {
    /// Write a page's worth of data to storage at the specified byte offset.
    fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Read data from storage at the specified byte offset.
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Flush pending writes to storage.
    fn flush(&mut self) -> Result<()>;

    /// Size of the storage device in bytes.
    fn size(&self) -> u64;

    /// Truncate the storage to the specified size.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Release any OS-level resources held by this device.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    /// Whether this device supports memory mapping.
    fn supports_mmap(&self) -> bool {
        false
    }

    /// Get memory-mapped access to the storage, if supported.
    fn get_mmap(&mut self, offset: u64, len: usize) -> Result<Option<&mut [u8]>> {
        let _ = (offset, len);
        Ok(None)
    }
}

/// Plain file-based storage device.
pub struct FileSystemDisk {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
}

impl FileSystemDisk {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Self { file, path })
    }
}

impl Device for FileSystemDisk {
    fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_page(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        use std::io::Write;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }
}

/// Memory-mapped storage device for high-throughput large file access.
pub struct MmapDisk {
    file: File,
    mmap: Option<MmapMut>,
    #[allow(dead_code)]
    path: PathBuf,
    size: u64,
    dirty: bool,
}

impl MmapDisk {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let size = file.metadata()?.len();

        let mut device = Self {
            file,
            mmap: None,
            path,
            size,
            dirty: false,
        };

        if size > 0 {
            device.init_mmap()?;
        }

        Ok(device)
    }

    fn init_mmap(&mut self) -> Result<()> {
        if self.size > 0 {
            let mmap = unsafe { MmapOptions::new().len(self.size as usize).map_mut(&self.file)? };
            self.mmap = Some(mmap);
        }
        Ok(())
    }

    fn resize_and_remap(&mut self, new_size: u64) -> Result<()> {
        if new_size != self.size {
            self.mmap = None;
            self.file.set_len(new_size)?;
            self.size = new_size;
            if new_size > 0 {
                self.init_mmap()?;
            }
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, offset: u64, len: usize) -> Result<()> {
        let required_size = offset + len as u64;
        if required_size > self.size {
            const GROWTH_CHUNK: u64 = 64 * 1024 * 1024;
            let new_size = required_size.div_ceil(GROWTH_CHUNK) * GROWTH_CHUNK;
            self.resize_and_remap(new_size)?;
        }
        Ok(())
    }
}

impl Device for MmapDisk {
    fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_capacity(offset, data.len())?;

        if let Some(ref mut mmap) = self.mmap {
            let start = offset as usize;
            let end = start + data.len();
            if end <= mmap.len() {
                mmap[start..end].copy_from_slice(data);
                self.dirty = true;
                return Ok(());
            }
        }

        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_page(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if let Some(ref mmap) = self.mmap {
            let start = offset as usize;
            let len = buf.len().min(mmap.len().saturating_sub(start));
            if len > 0 {
                buf[..len].copy_from_slice(&mmap[start..start + len]);
                return Ok(len);
            }
        }

        use std::io::{Read, Seek, SeekFrom};
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(ref mut mmap) = self.mmap {
                mmap.flush()?;
            }
            self.file.sync_all()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.resize_and_remap(size)
    }

    fn supports_mmap(&self) -> bool {
        true
    }

    fn get_mmap(&mut self, offset: u64, len: usize) -> Result<Option<&mut [u8]>> {
        self.ensure_capacity(offset, len)?;
        if let Some(ref mut mmap) = self.mmap {
            let start = offset as usize;
            let end = start + len;
            if end <= mmap.len() {
                return Ok(Some(&mut mmap[start..end]));
            }
        }
        Ok(None)
    }
}

impl Drop for MmapDisk {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
