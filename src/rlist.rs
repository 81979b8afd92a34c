//! Persistent retrieve list: one mapped file per source directory holding
//! every remote file ever observed there, with size, mtime and assignment
//! state.
//!
//! Layout: the common table header, then fixed-size entries. The header
//! count (`current_no_of_listed_files`) is authoritative: it is written
//! last after entry writes and re-read inside every iteration; readers
//! treat a decrease as "another worker compacted, abort this pass".
//!
//! Lock geometry on the file: byte 0 is the process-wide region that
//! serialises scan-reset, grow and compaction; byte `WORD_OFFSET + i` is
//! the region for entry `i`. The two ranges never overlap.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::error::FetchError;
use crate::lock::{RegionGuard, lock_guard, try_lock_guard, try_lock_region, unlock_region};
use crate::table::{MappedFile, TABLE_VERSION, WORD_OFFSET, fixed_str, set_fixed_str};

pub const MAX_FILENAME_LENGTH: usize = 256;

/// Entries are appended in chunks of this many slots; compaction shrinks
/// back to a chunk boundary.
pub const RETRIEVE_LIST_STEP: usize = 50;

// special_flag bits
pub const RL_GOT_EXACT_SIZE: u8 = 1;
pub const RL_GOT_EXACT_DATE: u8 = 2;
pub const RL_GOT_SIZE_DATE: u8 = 4;

/// Process-wide lock region (scan-reset, grow, compact).
const LOCK_RETR_PROC: u64 = 0;
/// First per-entry lock byte; entry `i` locks at `LOCK_RETR_BASE + i`.
const LOCK_RETR_BASE: u64 = WORD_OFFSET as u64;

const PROC_LOCK_ATTEMPTS: u32 = 30;
const PROC_LOCK_RETRY: Duration = Duration::from_millis(100);

#[repr(C)]
pub struct RlEntry {
    pub file_name: [u8; MAX_FILENAME_LENGTH],
    pub size: i64,
    pub prev_size: i64,
    pub file_mtime: i64,
    pub got_date: u8,
    pub special_flag: u8,
    pub in_list: u8,
    pub retrieved: u8,
    pub assigned: u32,
}

pub const RL_ENTRY_SIZE: usize = std::mem::size_of::<RlEntry>();

impl RlEntry {
    pub fn name(&self) -> &str {
        fixed_str(&self.file_name)
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned != 0
    }

    /// Worker that owns this entry, when assigned. Stored as id + 1 so
    /// zero stays the free marker.
    pub fn assigned_worker(&self) -> Option<u32> {
        if self.assigned == 0 { None } else { Some(self.assigned - 1) }
    }
}

/// Attach behaviour when the list file does not exist yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    /// Fail with `StoreUnavailable`; the directory was never scanned.
    Required,
    /// Create an empty list (first scan of a directory).
    CreateIfMissing,
}

#[derive(Debug)]
pub struct RlistHandle {
    map: MappedFile,
}

impl RlistHandle {
    /// Open (and lazily create) the retrieve list for one directory.
    pub fn attach(path: &Path, mode: AttachMode) -> Result<Self> {
        if !path.exists() {
            match mode {
                AttachMode::Required => {
                    return Err(FetchError::StoreUnavailable(path.display().to_string()).into());
                }
                AttachMode::CreateIfMissing => {
                    let len = WORD_OFFSET + RETRIEVE_LIST_STEP * RL_ENTRY_SIZE;
                    drop(MappedFile::create(path, len, 0)?);
                }
            }
        }
        let map = MappedFile::open(path)?;
        if map.header().version != TABLE_VERSION {
            return Err(FetchError::AllocError(format!(
                "{}: unsupported retrieve list version {}",
                path.display(),
                map.header().version
            ))
            .into());
        }
        Ok(Self { map })
    }

    /// Authoritative entry count, re-read from the header on every call.
    pub fn count(&self) -> usize {
        let n = self.map.header().no_of_entries;
        if n < 0 { 0 } else { n as usize }
    }

    fn set_count(&mut self, n: usize) {
        self.map.header_mut().no_of_entries = n as i32;
    }

    pub fn capacity(&self) -> usize {
        (self.map.len() - WORD_OFFSET) / RL_ENTRY_SIZE
    }

    /// Another process may have grown the file; make sure our mapping
    /// covers the advertised count before dereferencing entries. The
    /// descriptor is kept, so entry locks held across the refresh stay
    /// held.
    fn ensure_mapped(&mut self) -> Result<()> {
        let needed = WORD_OFFSET + self.count() * RL_ENTRY_SIZE;
        if needed > self.map.len() {
            self.map.remap()?;
        }
        Ok(())
    }

    pub fn entry(&mut self, idx: usize) -> Result<&RlEntry> {
        self.ensure_mapped()?;
        if idx >= self.count() {
            return Err(FetchError::AllocError(format!(
                "retrieve list index {} out of range",
                idx
            ))
            .into());
        }
        Ok(unsafe { &*(self.map.entry_ptr(idx, RL_ENTRY_SIZE) as *const RlEntry) })
    }

    /// Mutable entry view. Writes to assignment and the size/mtime/
    /// retrieved fields are only valid while the entry's lock region is
    /// held.
    pub fn entry_mut(&mut self, idx: usize) -> Result<&mut RlEntry> {
        self.ensure_mapped()?;
        if idx >= self.count() {
            return Err(FetchError::AllocError(format!(
                "retrieve list index {} out of range",
                idx
            ))
            .into());
        }
        Ok(unsafe { &mut *(self.map.entry_ptr(idx, RL_ENTRY_SIZE) as *mut RlEntry) })
    }

    /// Linear lookup by name. The list is small (hundreds of entries) and
    /// positionally addressed, so no index is kept.
    pub fn find(&mut self, name: &str) -> Result<Option<usize>> {
        self.ensure_mapped()?;
        for i in 0..self.count() {
            if self.entry(i)?.name() == name {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Serialise scan-reset / grow / compact against other workers,
    /// blocking until the region is granted.
    pub fn lock_proc(&self) -> Result<RegionGuard> {
        lock_guard(self.map.lock_file(), LOCK_RETR_PROC)
            .map_err(|e| FetchError::LockError(format!("retrieve list proc: {}", e)).into())
    }

    /// Helper-side acquisition: bounded retries with backoff. `None` means
    /// another process holds the list and is doing the work, so the helper
    /// exits `SUCCESS` without scanning.
    pub fn lock_proc_for_helper(&self) -> Result<Option<RegionGuard>> {
        for attempt in 0..PROC_LOCK_ATTEMPTS {
            match try_lock_guard(self.map.lock_file(), LOCK_RETR_PROC) {
                Ok(Some(guard)) => return Ok(Some(guard)),
                Ok(None) => {
                    if attempt + 1 < PROC_LOCK_ATTEMPTS {
                        std::thread::sleep(PROC_LOCK_RETRY);
                    }
                }
                Err(e) => {
                    return Err(
                        FetchError::LockError(format!("retrieve list proc: {}", e)).into()
                    );
                }
            }
        }
        Ok(None)
    }

    /// Blocking entry lock, for the short field-write windows where the
    /// entry is already owned through its assignment mark.
    pub fn lock_entry(&self, idx: usize) -> Result<RegionGuard> {
        lock_guard(self.map.lock_file(), LOCK_RETR_BASE + idx as u64)
            .map_err(|e| FetchError::LockError(format!("retrieve list entry {}: {}", idx, e)).into())
    }

    /// Non-blocking entry lock; `false` means another worker owns this
    /// name for the current pass and we skip it.
    pub fn try_lock_entry(&self, idx: usize) -> Result<bool> {
        try_lock_region(self.map.lock_file(), LOCK_RETR_BASE + idx as u64)
            .map_err(|e| FetchError::LockError(format!("retrieve list entry {}: {}", idx, e)).into())
    }

    pub fn unlock_entry(&self, idx: usize) -> Result<()> {
        unlock_region(self.map.lock_file(), LOCK_RETR_BASE + idx as u64)
            .map_err(|e| FetchError::LockError(format!("retrieve list entry {}: {}", idx, e)).into())
    }

    /// Append a new entry, growing the backing file by a step when the
    /// capacity is exhausted. The header count is written only after the
    /// entry slot is complete. Grow never happens under an entry lock.
    pub fn insert(&mut self, name: &str, size: i64, mtime: i64, special_flag: u8) -> Result<usize> {
        self.ensure_mapped()?;
        let idx = self.count();
        if idx >= self.capacity() {
            let new_len = WORD_OFFSET + (self.capacity() + RETRIEVE_LIST_STEP) * RL_ENTRY_SIZE;
            self.map.resize(new_len)?;
        }
        {
            let slot = unsafe { &mut *(self.map.entry_ptr(idx, RL_ENTRY_SIZE) as *mut RlEntry) };
            set_fixed_str(&mut slot.file_name, name);
            slot.size = size;
            slot.prev_size = 0;
            slot.file_mtime = mtime;
            slot.got_date = u8::from(mtime != -1);
            slot.special_flag = special_flag;
            slot.in_list = 1;
            slot.retrieved = 0;
            slot.assigned = 0;
        }
        self.set_count(idx + 1);
        Ok(idx)
    }

    /// Drop all entries not marked `in_list` by the scan that just ended,
    /// with a stable move of the tail, then shrink to a step boundary.
    /// Only legal while holding the process lock; the guard is the proof.
    pub fn compact(&mut self, _proc: &RegionGuard) -> Result<usize> {
        self.ensure_mapped()?;
        let count = self.count();
        let mut write = 0usize;
        for read in 0..count {
            let keep = self.entry(read)?.in_list == 1;
            if keep {
                if write != read {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            self.map.entry_ptr(read, RL_ENTRY_SIZE),
                            self.map.entry_ptr(write, RL_ENTRY_SIZE),
                            RL_ENTRY_SIZE,
                        );
                    }
                }
                write += 1;
            }
        }
        self.set_count(write);
        let want_cap = write.div_ceil(RETRIEVE_LIST_STEP).max(1) * RETRIEVE_LIST_STEP;
        if want_cap < self.capacity() {
            self.map.resize(WORD_OFFSET + want_cap * RL_ENTRY_SIZE)?;
        }
        Ok(count - write)
    }

    /// Truncate to zero entries. Only legal for the remove / get-once
    /// policies, where the list never outlives one scan cycle.
    pub fn reset(&mut self, _proc: &RegionGuard) -> Result<()> {
        self.set_count(0);
        let len = WORD_OFFSET + RETRIEVE_LIST_STEP * RL_ENTRY_SIZE;
        if self.map.len() != len {
            self.map.resize(len)?;
        }
        Ok(())
    }
}
