//! C1 — the file-mapping manager.
//!
//! The archive file is one contiguous region `[ header | data | metadata ]`.
//! `Mapping` owns the single `memmap2::MmapMut` backing it and hands out
//! byte slices into each region, recomputed from the current region sizes
//! on every call — never a raw pointer held across a `remap`.
use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapMut;

pub struct Mapping {
    file: File,
    mmap: Option<MmapMut>,
    header_size: u64,
    data_size: u64,
    md_size: u64,
}

impl Mapping {
    /// Opens an existing archive file. Does not map it; callers call
    /// `remap` once they know the region sizes (read from the header).
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening archive {}", path.display()))?;
        Ok(Self {
            file,
            mmap: None,
            header_size: 0,
            data_size: 0,
            md_size: 0,
        })
    }

    /// Creates a new, empty (zero-length) archive file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating archive {}", path.display()))?;
        Ok(Self {
            file,
            mmap: None,
            header_size: 0,
            data_size: 0,
            md_size: 0,
        })
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }
    pub fn data_size(&self) -> u64 {
        self.data_size
    }
    pub fn md_size(&self) -> u64 {
        self.md_size
    }
    pub fn total_size(&self) -> u64 {
        self.header_size + self.data_size + self.md_size
    }

    /// Unmaps (if mapped), truncates the file to the given total size, and
    /// re-establishes the mapping. Any slice previously returned by
    /// `header_mut`/`data_mut`/`md_mut` is invalidated by this call.
    pub fn remap(&mut self, header_size: u64, data_size: u64, md_size: u64) -> Result<()> {
        self.mmap = None; // drop the old mapping first
        let total = header_size + data_size + md_size;
        self.file
            .set_len(total)
            .with_context(|| format!("truncating archive to {total} bytes"))?;
        let mmap = if total == 0 {
            None
        } else {
            Some(unsafe {
                MmapMut::map_mut(&self.file).context("mmap of archive file failed")?
            })
        };
        self.header_size = header_size;
        self.data_size = data_size;
        self.md_size = md_size;
        self.mmap = mmap;
        Ok(())
    }

    fn buf(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
    fn buf_mut(&mut self) -> &mut [u8] {
        self.mmap.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn header(&self) -> &[u8] {
        &self.buf()[..self.header_size as usize]
    }
    pub fn header_mut(&mut self) -> &mut [u8] {
        let hs = self.header_size as usize;
        &mut self.buf_mut()[..hs]
    }

    pub fn data(&self) -> &[u8] {
        let start = self.header_size as usize;
        let end = start + self.data_size as usize;
        &self.buf()[start..end]
    }
    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = self.header_size as usize;
        let end = start + self.data_size as usize;
        &mut self.buf_mut()[start..end]
    }

    pub fn md(&self) -> &[u8] {
        let start = (self.header_size + self.data_size) as usize;
        &self.buf()[start..]
    }
    pub fn md_mut(&mut self) -> &mut [u8] {
        let start = (self.header_size + self.data_size) as usize;
        &mut self.buf_mut()[start..]
    }

    /// Shifts the METADATA region by `delta` bytes relative to its current
    /// position (positive = toward the end of the file, i.e. DATA grew;
    /// negative = toward the header, i.e. DATA shrank). Must be called
    /// *after* `remap` has already established the new, larger/smaller
    /// total mapping, and operates purely in memory.
    pub fn shift_md(&mut self, delta: i64) {
        if delta == 0 {
            return;
        }
        let header_size = self.header_size as usize;
        let data_size = self.data_size as usize;
        let md_size = self.md_size as usize;
        let buf = self.buf_mut();
        let old_start = (header_size as i64 + data_size as i64 - delta) as usize;
        let new_start = header_size + data_size;
        buf.copy_within(old_start..old_start + md_size, new_start);
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush().context("flushing archive mapping")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn remap_then_shift_grows_correctly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.cib");
        let mut m = Mapping::create(&path).unwrap();
        m.remap(64, 1024, 1024).unwrap();
        m.md_mut()[0] = 0xAB;
        // simulate DATA growing by one block: remap first, then shift.
        m.remap(64, 2048, 1024).unwrap();
        m.shift_md(1024);
        assert_eq!(m.md()[0], 0xAB);
    }
}
