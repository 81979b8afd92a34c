//! Shared status tables mapped read-write by every worker.
//!
//! Both tables (directories in `fra.rs`, hosts in `fsa.rs`) are flat
//! `#[repr(C)]` entry arrays behind a fixed header. Observers and workers
//! coordinate through byte-range lock regions computed from entry offsets;
//! topology changes are detected through the header generation counter.

pub mod fra;
pub mod fsa;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Result;
use memmap2::MmapMut;

use crate::error::FetchError;

/// Header padding boundary. Entries start at this offset and lock-region
/// addresses are computed from it.
pub const WORD_OFFSET: usize = 16;

/// Current on-disk layout version for both tables and the retrieve list.
pub const TABLE_VERSION: u8 = 3;

#[repr(C)]
pub struct TableHeader {
    pub no_of_entries: i32,
    pub generation: i32,
    pub version: u8,
    pub reserved: [u8; 3],
    pub pad: [u8; 4],
}

/// Result of re-checking a handle against the table generation.
/// Never collapse this into a bool: `Changed` means the handle was
/// re-pointed at the same id in a rebuilt table, `Gone` means the id no
/// longer exists and the worker must wind down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableCheck {
    Unchanged,
    Changed,
    Gone,
}

/// A mapped state file: owns the descriptor and the mapping together so
/// release happens on every exit path (the descriptor also carries the
/// byte-range locks).
#[derive(Debug)]
pub struct MappedFile {
    file: File,
    map: MmapMut,
    path: PathBuf,
}

impl MappedFile {
    /// Create a fresh file of `len` bytes with an initialised header.
    pub fn create(path: &Path, len: usize, no_of_entries: i32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mut mapped = Self::map_existing(file, path)?;
        let hdr = mapped.header_mut();
        hdr.no_of_entries = no_of_entries;
        hdr.generation = 1;
        hdr.version = TABLE_VERSION;
        Ok(mapped)
    }

    /// Map an existing file read-write.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            FetchError::AllocError(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::map_existing(file, path)
    }

    fn map_existing(file: File, path: &Path) -> Result<Self> {
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            FetchError::AllocError(format!("cannot map {}: {}", path.display(), e))
        })?;
        if map.len() < WORD_OFFSET {
            return Err(FetchError::AllocError(format!(
                "{} shorter than the table header",
                path.display()
            ))
            .into());
        }
        Ok(Self { file, map, path: path.to_path_buf() })
    }

    /// Grow or shrink the backing file and re-map. Callers serialise this
    /// through the process lock region; the generation bump is theirs too.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        self.file.set_len(new_len as u64).map_err(|e| {
            FetchError::AllocError(format!("cannot resize {}: {}", self.path.display(), e))
        })?;
        self.remap()
    }

    /// Refresh the mapping after another process changed the file length.
    /// Keeps the descriptor (and with it every lock region held on it).
    pub fn remap(&mut self) -> Result<()> {
        self.map = unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| {
            FetchError::AllocError(format!("cannot remap {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor used for byte-range lock regions on this file.
    pub fn lock_file(&self) -> &File {
        &self.file
    }

    pub fn header(&self) -> &TableHeader {
        // mapped length checked at map time; header is at offset zero
        unsafe { &*(self.map.as_ptr() as *const TableHeader) }
    }

    pub fn header_mut(&mut self) -> &mut TableHeader {
        unsafe { &mut *(self.map.as_mut_ptr() as *mut TableHeader) }
    }

    /// Raw pointer to entry `idx` of an array of `size`-byte entries.
    /// The caller guarantees idx is inside the mapped entry count and that
    /// mutation only happens under the entry's lock region.
    pub(crate) fn entry_ptr(&self, idx: usize, size: usize) -> *mut u8 {
        debug_assert!(WORD_OFFSET + (idx + 1) * size <= self.map.len());
        unsafe { self.map.as_ptr().add(WORD_OFFSET + idx * size) as *mut u8 }
    }
}

/// Read a NUL-terminated fixed field as &str (lossless for the ASCII names
/// this system deals in; anything else is surfaced as-is up to the NUL).
pub fn fixed_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Store `s` into a fixed field, truncating to capacity minus the NUL.
pub fn set_fixed_str(buf: &mut [u8], s: &str) {
    let n = s.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    buf[n..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_round_trip() {
        let mut buf = [0u8; 8];
        set_fixed_str(&mut buf, "abc");
        assert_eq!(fixed_str(&buf), "abc");
        set_fixed_str(&mut buf, "longer-than-field");
        assert_eq!(fixed_str(&buf), "longer-");
    }

    #[test]
    fn create_initialises_header() {
        let path = std::env::temp_dir().join(format!(
            "gf_table_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mapped = MappedFile::create(&path, WORD_OFFSET + 64, 2).expect("create");
        assert_eq!(mapped.header().no_of_entries, 2);
        assert_eq!(mapped.header().generation, 1);
        assert_eq!(mapped.header().version, TABLE_VERSION);
        drop(mapped);
        let reopened = MappedFile::open(&path).expect("open");
        assert_eq!(reopened.header().no_of_entries, 2);
        let _ = std::fs::remove_file(&path);
    }
}
