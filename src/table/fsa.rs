//! Per-host transfer status table.
//!
//! One entry per remote host, carrying the connection budget, transfer
//! counters and one job slot per parallel fetch worker. Counter pairs that
//! must stay consistent (`active_transfers` with `trl_per_process`,
//! `total_file_counter` with `total_file_size`) are only ever touched under
//! their named lock region.

use std::mem::offset_of;
use std::path::Path;

use anyhow::Result;

use super::{MappedFile, TableCheck, WORD_OFFSET, fixed_str, set_fixed_str};
use crate::error::FetchError;
use crate::lock::{RegionGuard, lock_guard};

pub const MAX_HOSTNAME_LENGTH: usize = 8;
pub const MAX_HOST_ALIAS_LENGTH: usize = 40;
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 64;
pub use crate::rlist::MAX_FILENAME_LENGTH;
pub const MAX_PARALLEL_FETCHES: usize = 8;
pub const ERROR_HISTORY_LENGTH: usize = 5;

// host_status bits
pub const HOST_ERROR_ACKNOWLEDGED: u32 = 1;
pub const HOST_ERROR_ACKNOWLEDGED_T: u32 = 2;
pub const HOST_ERROR_OFFLINE: u32 = 4;
pub const HOST_ERROR_OFFLINE_T: u32 = 8;
pub const AUTO_PAUSE_QUEUE_STAT: u32 = 16;
pub const DONT_KEEP_CONNECTION: u32 = 32;

// connect_status values
pub const DISCONNECTED: u8 = 0;
pub const CONNECTING: u8 = 1;
pub const CONNECTED: u8 = 2;
pub const RETRIEVING: u8 = 3;
pub const NOT_WORKING: u8 = 4;

/// Byte index inside `unique_name` the supervisor writes to request a
/// disconnect from the keep-alive arbiter.
pub const CANCEL_SIGNAL_INDEX: usize = 2;
pub const CANCEL_SIGNAL_BYTE: u8 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct JobStatus {
    pub file_name_in_use: [u8; MAX_FILENAME_LENGTH],
    pub unique_name: [u8; 16],
    pub file_size: i64,
    pub file_size_done: i64,
    pub file_size_in_use: i64,
    pub file_size_in_use_done: i64,
    pub bytes_send: u64,
    pub no_of_files: u32,
    pub no_of_files_done: u32,
    pub proc_id: i32,
    pub connect_status: u8,
    pub pad: [u8; 3],
}

#[repr(C)]
pub struct FsaEntry {
    pub host_alias: [u8; MAX_HOST_ALIAS_LENGTH],
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LENGTH]; 2],
    pub job_status: [JobStatus; MAX_PARALLEL_FETCHES],
    pub total_file_size: i64,
    pub transfer_rate_limit: i64,
    pub trl_per_process: i64,
    pub start_event_handle: i64,
    pub end_event_handle: i64,
    pub host_id: u32,
    pub allowed_transfers: u32,
    pub active_transfers: u32,
    pub transfer_timeout: u32,
    pub block_size: u32,
    pub error_counter: u32,
    pub host_status: u32,
    pub total_file_counter: u32,
    pub error_history: [u8; ERROR_HISTORY_LENGTH],
    pub host_toggle: u8,
    pub auto_toggle: u8,
    pub pad: u8,
}

pub const FSA_ENTRY_SIZE: usize = std::mem::size_of::<FsaEntry>();

impl FsaEntry {
    pub fn zeroed() -> Self {
        let mut e: Self = unsafe { std::mem::zeroed() };
        e.host_toggle = 1;
        e.block_size = 4096;
        e.allowed_transfers = 1;
        e.transfer_timeout = 120;
        e
    }

    pub fn alias(&self) -> &str {
        fixed_str(&self.host_alias)
    }

    pub fn set_alias(&mut self, s: &str) {
        set_fixed_str(&mut self.host_alias, s);
    }

    /// Hostname the session should dial. `host_toggle` is 1-based; with
    /// `temp_toggle` the other side is used without flipping the stored
    /// value.
    pub fn dial_hostname(&self, temp_toggle: bool) -> &str {
        let mut side = (self.host_toggle.max(1) - 1) as usize & 1;
        if temp_toggle {
            side ^= 1;
        }
        let name = fixed_str(&self.real_hostname[side]);
        if name.is_empty() { fixed_str(&self.real_hostname[0]) } else { name }
    }

    pub fn set_real_hostname(&mut self, side: usize, s: &str) {
        set_fixed_str(&mut self.real_hostname[side & 1], s);
    }
}

/// Handle of one worker onto one host entry plus its own job slot.
pub struct FsaHandle {
    map: MappedFile,
    pos: usize,
    host_id: u32,
    generation: i32,
    job_slot: usize,
}

fn entry_count(map: &MappedFile) -> usize {
    let n = map.header().no_of_entries;
    if n < 0 { 0 } else { n as usize }
}

fn entry_at(map: &MappedFile, idx: usize) -> &FsaEntry {
    unsafe { &*(map.entry_ptr(idx, FSA_ENTRY_SIZE) as *const FsaEntry) }
}

fn find_by_id(map: &MappedFile, host_id: u32) -> Option<usize> {
    (0..entry_count(map)).find(|&i| entry_at(map, i).host_id == host_id)
}

impl FsaHandle {
    /// Map the table at `pos`, verifying that the slot still carries
    /// `host_id` (the supervisor passes both so a stale position is caught
    /// before the first counter update).
    pub fn attach(path: &Path, pos: usize, host_id: u32, job_slot: usize) -> Result<Self> {
        let map = MappedFile::open(path)?;
        if job_slot >= MAX_PARALLEL_FETCHES {
            return Err(
                FetchError::Incorrect(format!("job slot {} out of range", job_slot)).into()
            );
        }
        let pos = if pos < entry_count(&map) && entry_at(&map, pos).host_id == host_id {
            pos
        } else {
            find_by_id(&map, host_id)
                .ok_or_else(|| FetchError::StaleHandle(format!("host id {}", host_id)))?
        };
        let generation = map.header().generation;
        Ok(Self { map, pos, host_id, generation, job_slot })
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn job_slot(&self) -> usize {
        self.job_slot
    }

    pub fn entry(&self) -> &FsaEntry {
        entry_at(&self.map, self.pos)
    }

    pub fn entry_mut(&mut self) -> &mut FsaEntry {
        unsafe { &mut *(self.map.entry_ptr(self.pos, FSA_ENTRY_SIZE) as *mut FsaEntry) }
    }

    pub fn job(&self) -> &JobStatus {
        &self.entry().job_status[self.job_slot]
    }

    pub fn job_mut(&mut self) -> &mut JobStatus {
        let slot = self.job_slot;
        &mut self.entry_mut().job_status[slot]
    }

    /// Re-check the generation counter, re-resolving by host id on change.
    pub fn check(&mut self) -> TableCheck {
        if self.map.header().generation == self.generation {
            return TableCheck::Unchanged;
        }
        let remapped = match MappedFile::open(self.map.path()) {
            Ok(m) => m,
            Err(_) => return TableCheck::Gone,
        };
        match find_by_id(&remapped, self.host_id) {
            Some(pos) => {
                self.generation = remapped.header().generation;
                self.map = remapped;
                self.pos = pos;
                TableCheck::Changed
            }
            None => TableCheck::Gone,
        }
    }

    fn region(&self, field_offset: usize) -> u64 {
        (WORD_OFFSET + self.pos * FSA_ENTRY_SIZE + field_offset) as u64
    }

    /// Guard for error_counter + error_history transitions.
    pub fn lock_ec(&self) -> Result<RegionGuard> {
        lock_guard(self.map.lock_file(), self.region(offset_of!(FsaEntry, error_counter)))
            .map_err(|e| FetchError::LockError(format!("fsa ec: {}", e)).into())
    }

    /// Guard for host_status and the event handles.
    pub fn lock_hs(&self) -> Result<RegionGuard> {
        lock_guard(self.map.lock_file(), self.region(offset_of!(FsaEntry, host_status)))
            .map_err(|e| FetchError::LockError(format!("fsa hs: {}", e)).into())
    }

    /// Guard for the total file counter/size pair and the done counters.
    pub fn lock_tfc(&self) -> Result<RegionGuard> {
        lock_guard(self.map.lock_file(), self.region(offset_of!(FsaEntry, total_file_counter)))
            .map_err(|e| FetchError::LockError(format!("fsa tfc: {}", e)).into())
    }

    /// Guard for active_transfers + trl_per_process.
    pub fn lock_con(&self) -> Result<RegionGuard> {
        lock_guard(self.map.lock_file(), self.region(offset_of!(FsaEntry, active_transfers)))
            .map_err(|e| FetchError::LockError(format!("fsa con: {}", e)).into())
    }

    /// Register this worker as an active transfer and derive its rate
    /// share. Holds `LOCK_CON` for the whole two-field update.
    pub fn register_transfer(&mut self, proc_id: i32) -> Result<()> {
        let guard = self.lock_con()?;
        let e = self.entry_mut();
        if e.active_transfers < e.allowed_transfers {
            e.active_transfers += 1;
        }
        e.trl_per_process = if e.transfer_rate_limit > 0 {
            e.transfer_rate_limit / i64::from(e.active_transfers.max(1))
        } else {
            e.transfer_rate_limit
        };
        drop(guard);
        let job = self.job_mut();
        job.proc_id = proc_id;
        job.connect_status = CONNECTING;
        Ok(())
    }

    /// Drop this worker from the active set, honouring the zero floor even
    /// on double-deregister after a fatal error path.
    pub fn deregister_transfer(&mut self) -> Result<()> {
        let guard = self.lock_con()?;
        let e = self.entry_mut();
        if e.active_transfers > 0 {
            e.active_transfers -= 1;
        }
        e.trl_per_process = if e.transfer_rate_limit > 0 {
            e.transfer_rate_limit / i64::from(e.active_transfers.max(1))
        } else {
            e.transfer_rate_limit
        };
        drop(guard);
        let job = self.job_mut();
        job.connect_status = DISCONNECTED;
        job.proc_id = -1;
        Ok(())
    }

    /// Account one streamed chunk for this job slot. The aggregate pair is
    /// guarded; the in-use fields are only ever written by the owning
    /// worker.
    pub fn add_chunk(&mut self, n: u64) -> Result<()> {
        let guard = self.lock_tfc()?;
        let slot = self.job_slot;
        {
            let e = self.entry_mut();
            let job = &mut e.job_status[slot];
            job.file_size_in_use_done += n as i64;
            job.file_size_done += n as i64;
            job.bytes_send += n;
        }
        drop(guard);
        Ok(())
    }

    /// Account a completed file: per-host totals shrink by the recorded
    /// size and grow by the delta actually observed on the wire.
    pub fn file_done(&mut self, recorded_size: i64, observed_size: i64) -> Result<()> {
        let guard = self.lock_tfc()?;
        let slot = self.job_slot;
        {
            let e = self.entry_mut();
            if e.total_file_counter > 0 {
                e.total_file_counter -= 1;
            }
            // the queue total was built from the probed size; correct it by
            // the observed delta before removing the file from the total
            e.total_file_size += observed_size - recorded_size;
            e.total_file_size -= observed_size;
            if e.total_file_size < 0 {
                e.total_file_size = 0;
            }
            let job = &mut e.job_status[slot];
            job.no_of_files_done += 1;
            job.file_size_in_use = 0;
            job.file_size_in_use_done = 0;
            job.file_name_in_use.fill(0);
        }
        drop(guard);
        Ok(())
    }

    /// Whether the supervisor has written the cancel byte into our slot.
    pub fn cancel_requested(&self) -> bool {
        self.job().unique_name[CANCEL_SIGNAL_INDEX] == CANCEL_SIGNAL_BYTE
    }
}

/// Build a fresh host table from seed entries.
pub fn create(path: &Path, entries: &[FsaEntry]) -> Result<()> {
    let len = WORD_OFFSET + entries.len() * FSA_ENTRY_SIZE;
    let map = MappedFile::create(path, len, entries.len() as i32)?;
    for (i, e) in entries.iter().enumerate() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                e as *const FsaEntry,
                map.entry_ptr(i, FSA_ENTRY_SIZE) as *mut FsaEntry,
                1,
            );
        }
    }
    Ok(())
}
