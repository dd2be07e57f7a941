//! Sector allocation bitmap
//!
//! One bit per sector, persisted to a flat file. Reads and writes go through
//! a single-page write-back cache; touching a different page flushes the
//! dirty page first. Bit contents are rebuilt from the live cluster index at
//! startup, so only the length is trusted from disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tessera_core::Result;

/// Page granularity of the write-back cache, in bytes.
const PAGE_SIZE: usize = 4096;

/// Persisted bit-per-sector allocation map.
pub struct SectorBitmap {
    file: File,
    length: u64,
    page: Vec<u8>,
    page_index: Option<u64>,
    dirty: bool,
}

impl SectorBitmap {
    /// Open or create the bitmap file with capacity for `length` bits.
    pub fn open(path: impl AsRef<Path>, length: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut bitmap = Self {
            file,
            length: 0,
            page: vec![0u8; PAGE_SIZE],
            page_index: None,
            dirty: false,
        };
        bitmap.set_length(length)?;
        Ok(bitmap)
    }

    /// Number of addressable bits.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Resize to `length` bits. The file is zero-filled and the page cache
    /// reset, so all bits read false afterwards.
    pub fn set_length(&mut self, length: u64) -> Result<()> {
        let byte_len = length.div_ceil(8);
        let file_len = byte_len.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;

        self.file.set_len(0)?;
        self.file.set_len(file_len)?;
        self.length = length;
        self.page_index = None;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&mut self, index: u64) -> Result<bool> {
        debug_assert!(index < self.length);
        let byte = index / 8;
        self.load_page(byte / PAGE_SIZE as u64)?;
        let offset = (byte % PAGE_SIZE as u64) as usize;
        Ok(self.page[offset] & (1 << (index % 8)) != 0)
    }

    pub fn set(&mut self, index: u64, value: bool) -> Result<()> {
        debug_assert!(index < self.length);
        let byte = index / 8;
        self.load_page(byte / PAGE_SIZE as u64)?;
        let offset = (byte % PAGE_SIZE as u64) as usize;
        let mask = 1 << (index % 8);
        if value {
            self.page[offset] |= mask;
        } else {
            self.page[offset] &= !mask;
        }
        self.dirty = true;
        Ok(())
    }

    /// Write the dirty page back to disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(index) = self.page_index {
                self.file
                    .seek(SeekFrom::Start(index * PAGE_SIZE as u64))?;
                self.file.write_all(&self.page)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn load_page(&mut self, index: u64) -> Result<()> {
        if self.page_index == Some(index) {
            return Ok(());
        }
        self.flush()?;
        self.file.seek(SeekFrom::Start(index * PAGE_SIZE as u64))?;
        self.file.read_exact(&mut self.page)?;
        self.page_index = Some(index);
        Ok(())
    }
}
