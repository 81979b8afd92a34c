//! Per-directory retrieve status table.
//!
//! One entry per configured source directory. Workers map the table
//! read-write; dashboards map it read-only and never take write locks.

use std::mem::offset_of;
use std::path::Path;

use anyhow::Result;

use super::{MappedFile, TableCheck, WORD_OFFSET, fixed_str, set_fixed_str};
use crate::error::FetchError;
use crate::lock::{RegionGuard, lock_guard};

pub const MAX_DIR_ALIAS_LENGTH: usize = 64;
pub const MAX_RECIPIENT_LENGTH: usize = 256;
pub const MAX_FILTER_LENGTH: usize = 1024;
pub const MAX_TIMEZONE_LENGTH: usize = 32;
pub const MAX_TIME_ENTRIES: usize = 4;

// dir_flag bits
pub const ALL_DISABLED: u32 = 1;
pub const DIR_ERROR_SET: u32 = 2;
pub const ONE_PROCESS_JUST_SCANNING: u32 = 4;
pub const MAX_COPIED: u32 = 8;
pub const DISTRIBUTED_HELPER_JOB: u32 = 16;

// delete_files_flag bits
pub const UNKNOWN_FILES: u32 = 1;
pub const OLD_LOCKED_FILES: u32 = 2;
pub const OLD_RLOCKED_FILES: u32 = 4;

/// Reacquisition policy for files already seen in an earlier scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReacquirePolicy {
    None,
    GetOnceExact,
    GetOnceInexact,
    AppendOnly,
    Remove,
}

impl ReacquirePolicy {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::GetOnceExact,
            2 => Self::GetOnceInexact,
            3 => Self::AppendOnly,
            4 => Self::Remove,
            _ => Self::None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::GetOnceExact => 1,
            Self::GetOnceInexact => 2,
            Self::AppendOnly => 3,
            Self::Remove => 4,
        }
    }

    /// Policies where a fetched file never re-enters the candidate set and
    /// the retrieve list may be reset instead of compacted.
    pub fn is_get_once(self) -> bool {
        matches!(self, Self::GetOnceExact | Self::GetOnceInexact)
    }
}

/// Comparator applied to ignore_size / ignore_file_time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compare {
    Off,
    Equal,
    Less,
    Greater,
}

impl Compare {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Equal,
            2 => Self::Less,
            3 => Self::Greater,
            _ => Self::Off,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Equal => 1,
            Self::Less => 2,
            Self::Greater => 3,
        }
    }

    /// True when `observed` falls on the ignored side of `limit`.
    pub fn matches(self, observed: i64, limit: i64) -> bool {
        match self {
            Self::Off => false,
            Self::Equal => observed == limit,
            Self::Less => observed < limit,
            Self::Greater => observed > limit,
        }
    }
}

/// One cron-style schedule slot, stored as bitmasks so the mapped entry
/// stays fixed-size. Bit `n` set means field value `n` fires.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TimeEntryRaw {
    pub minute: u64,
    pub hour: u32,
    pub day_of_month: u32,
    pub month: u16,
    pub day_of_week: u8,
    pub in_use: u8,
}

impl TimeEntryRaw {
    pub const fn empty() -> Self {
        Self { minute: 0, hour: 0, day_of_month: 0, month: 0, day_of_week: 0, in_use: 0 }
    }
}

#[repr(C)]
pub struct FraEntry {
    pub dir_alias: [u8; MAX_DIR_ALIAS_LENGTH],
    pub url: [u8; MAX_RECIPIENT_LENGTH],
    pub file_filters: [u8; MAX_FILTER_LENGTH],
    pub timezone: [u8; MAX_TIMEZONE_LENGTH],
    pub time_entries: [TimeEntryRaw; MAX_TIME_ENTRIES],
    pub max_copied_file_size: i64,
    pub ignore_size: i64,
    pub ignore_file_time: i64,
    pub locked_file_time: i64,
    pub unknown_file_time: i64,
    pub next_check_time: i64,
    pub warn_time: i64,
    pub last_retrieval: i64,
    pub bytes_received: u64,
    pub dir_id: u32,
    pub host_id: u32,
    pub fsa_pos: i32,
    pub max_copied_files: u32,
    pub delete_files_flag: u32,
    pub dir_flag: u32,
    pub keep_connected: u32,
    pub remote_file_check_interval: u32,
    pub no_of_time_entries: u32,
    pub error_counter: u32,
    pub max_errors: u32,
    pub files_received: u32,
    pub policy: u8,
    pub remove: u8,
    pub accept_dot_files: u8,
    pub ignore_size_op: u8,
    pub ignore_file_time_op: u8,
    pub pad: [u8; 3],
}

pub const FRA_ENTRY_SIZE: usize = std::mem::size_of::<FraEntry>();

impl FraEntry {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn alias(&self) -> &str {
        fixed_str(&self.dir_alias)
    }

    pub fn url_str(&self) -> &str {
        fixed_str(&self.url)
    }

    pub fn filters_str(&self) -> &str {
        fixed_str(&self.file_filters)
    }

    pub fn timezone_str(&self) -> &str {
        fixed_str(&self.timezone)
    }

    pub fn set_alias(&mut self, s: &str) {
        set_fixed_str(&mut self.dir_alias, s);
    }

    pub fn set_url(&mut self, s: &str) {
        set_fixed_str(&mut self.url, s);
    }

    pub fn set_filters(&mut self, s: &str) {
        set_fixed_str(&mut self.file_filters, s);
    }

    pub fn set_timezone(&mut self, s: &str) {
        set_fixed_str(&mut self.timezone, s);
    }

    pub fn policy(&self) -> ReacquirePolicy {
        ReacquirePolicy::from_u8(self.policy)
    }
}

/// Handle of one worker onto one directory entry.
pub struct FraHandle {
    map: MappedFile,
    pos: usize,
    dir_id: u32,
    generation: i32,
}

fn entry_count(map: &MappedFile) -> usize {
    let n = map.header().no_of_entries;
    if n < 0 { 0 } else { n as usize }
}

fn find_by_alias(map: &MappedFile, alias: &str) -> Option<usize> {
    (0..entry_count(map)).find(|&i| entry_at(map, i).alias() == alias)
}

fn find_by_id(map: &MappedFile, dir_id: u32) -> Option<usize> {
    (0..entry_count(map)).find(|&i| entry_at(map, i).dir_id == dir_id)
}

fn entry_at(map: &MappedFile, idx: usize) -> &FraEntry {
    unsafe { &*(map.entry_ptr(idx, FRA_ENTRY_SIZE) as *const FraEntry) }
}

impl FraHandle {
    /// Map the table and resolve `alias` to a position.
    pub fn attach(path: &Path, alias: &str) -> Result<Self> {
        let map = MappedFile::open(path)?;
        let pos = find_by_alias(&map, alias)
            .ok_or_else(|| FetchError::StaleHandle(format!("directory {}", alias)))?;
        let dir_id = entry_at(&map, pos).dir_id;
        let generation = map.header().generation;
        Ok(Self { map, pos, dir_id, generation })
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn dir_id(&self) -> u32 {
        self.dir_id
    }

    pub fn entry(&self) -> &FraEntry {
        entry_at(&self.map, self.pos)
    }

    /// Mutable view of the entry. Multi-field mutations that cross the
    /// error/status boundary go through [`FraHandle::lock_ec`] first.
    pub fn entry_mut(&mut self) -> &mut FraEntry {
        unsafe { &mut *(self.map.entry_ptr(self.pos, FRA_ENTRY_SIZE) as *mut FraEntry) }
    }

    /// Re-check the generation counter. On `Changed` the handle has been
    /// re-pointed at the same dir_id in the rebuilt table; on `Gone` the
    /// directory was removed from the configuration.
    pub fn check(&mut self) -> TableCheck {
        if self.map.header().generation == self.generation {
            return TableCheck::Unchanged;
        }
        // table rebuilt underneath us: remap the file and look the id up again
        let remapped = match MappedFile::open(self.map.path()) {
            Ok(m) => m,
            Err(_) => return TableCheck::Gone,
        };
        match find_by_id(&remapped, self.dir_id) {
            Some(pos) => {
                self.generation = remapped.header().generation;
                self.map = remapped;
                self.pos = pos;
                TableCheck::Changed
            }
            None => TableCheck::Gone,
        }
    }

    /// Lock region guarding error_counter + dir_flag transitions.
    pub fn lock_ec(&self) -> Result<RegionGuard> {
        let off = WORD_OFFSET
            + self.pos * FRA_ENTRY_SIZE
            + offset_of!(FraEntry, error_counter);
        lock_guard(self.map.lock_file(), off as u64)
            .map_err(|e| FetchError::LockError(format!("fra ec: {}", e)).into())
    }

    /// Lock region guarding the received counters and last_retrieval.
    pub fn lock_tfc(&self) -> Result<RegionGuard> {
        let off = WORD_OFFSET
            + self.pos * FRA_ENTRY_SIZE
            + offset_of!(FraEntry, bytes_received);
        lock_guard(self.map.lock_file(), off as u64)
            .map_err(|e| FetchError::LockError(format!("fra tfc: {}", e)).into())
    }
}

/// Build a fresh table from seed entries; bumps no generation history since
/// generation 1 is the first life of the file.
pub fn create(path: &Path, entries: &[FraEntry]) -> Result<()> {
    let len = WORD_OFFSET + entries.len() * FRA_ENTRY_SIZE;
    let map = MappedFile::create(path, len, entries.len() as i32)?;
    for (i, e) in entries.iter().enumerate() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                e as *const FraEntry,
                map.entry_ptr(i, FRA_ENTRY_SIZE) as *mut FraEntry,
                1,
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "gf_fra_test_{}_{}_{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    fn seed_entry(alias: &str, dir_id: u32) -> FraEntry {
        let mut e = FraEntry::zeroed();
        e.set_alias(alias);
        e.set_url("ftp://anonymous@example.net/pub");
        e.set_filters("*");
        e.dir_id = dir_id;
        e.max_errors = 10;
        e.remote_file_check_interval = 180;
        e
    }

    #[test]
    fn attach_resolves_alias_and_id() {
        let path = scratch_path("attach");
        create(&path, &[seed_entry("alpha", 11), seed_entry("beta", 22)]).expect("create");
        let h = FraHandle::attach(&path, "beta").expect("attach");
        assert_eq!(h.pos(), 1);
        assert_eq!(h.dir_id(), 22);
        assert_eq!(h.entry().alias(), "beta");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn check_follows_a_rebuilt_table() {
        let path = scratch_path("rebuild");
        create(&path, &[seed_entry("alpha", 11), seed_entry("beta", 22)]).expect("create");
        let mut h = FraHandle::attach(&path, "beta").expect("attach");
        assert_eq!(h.check(), TableCheck::Unchanged);

        // rebuild with beta moved to slot 0 and a bumped generation
        {
            let mut rebuilt = vec![seed_entry("beta", 22)];
            rebuilt.push(seed_entry("gamma", 33));
            create(&path, &rebuilt).expect("recreate");
            let mut m = MappedFile::open(&path).expect("open");
            m.header_mut().generation = 2;
        }
        assert_eq!(h.check(), TableCheck::Changed);
        assert_eq!(h.pos(), 0);
        assert_eq!(h.entry().alias(), "beta");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn check_reports_gone_when_id_vanished() {
        let path = scratch_path("gone");
        create(&path, &[seed_entry("alpha", 11)]).expect("create");
        let mut h = FraHandle::attach(&path, "alpha").expect("attach");
        {
            create(&path, &[seed_entry("other", 99)]).expect("recreate");
            let mut m = MappedFile::open(&path).expect("open");
            m.header_mut().generation = 5;
        }
        assert_eq!(h.check(), TableCheck::Gone);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn compare_matches_sides() {
        assert!(Compare::Equal.matches(100, 100));
        assert!(!Compare::Equal.matches(99, 100));
        assert!(Compare::Less.matches(99, 100));
        assert!(Compare::Greater.matches(101, 100));
        assert!(!Compare::Off.matches(100, 100));
    }
}
