//! Reconcile a fresh remote listing against the retrieve list and decide
//! what this worker fetches.
//!
//! Per name: normalise, select through the filter, look the name up in the
//! catalogue under its entry lock, refresh metadata, and either assign the
//! entry to this worker or record why not. Names the filter rejects feed
//! the stale-lock and unknown-file deletion rules. Per-entry locks are
//! taken non-blocking (losing one means another worker owns that name for
//! this pass) and are never held across a remote probe.

use anyhow::Result;
use chrono::Local;

use crate::filter::FileFilter;
use crate::remote::{Probe, RemoteSource};
use crate::report::{DeleteReason, LogSinks, Severity};
use crate::rlist::{
    MAX_FILENAME_LENGTH, RL_GOT_EXACT_DATE, RL_GOT_EXACT_SIZE, RL_GOT_SIZE_DATE, RlistHandle,
};
use crate::table::fra::{
    ALL_DISABLED, Compare, DISTRIBUTED_HELPER_JOB, FraHandle, MAX_COPIED, OLD_LOCKED_FILES,
    ONE_PROCESS_JUST_SCANNING, ReacquirePolicy, UNKNOWN_FILES,
};
use crate::table::fsa::FsaHandle;

/// Floor for every age-based deletion rule, seconds.
pub const DEFAULT_TRANSFER_TIMEOUT: i64 = 120;

/// What a scan pass decided.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOutcome {
    pub files_to_retrieve: u32,
    pub bytes_to_retrieve: i64,
    /// Candidates were left unassigned (caps, or this worker only scans).
    pub more_files_in_list: bool,
}

/// Per-pass snapshot of the directory policy, read once so the loop does
/// not keep dereferencing the mapped entry.
struct DirPolicy {
    policy: ReacquirePolicy,
    remove: bool,
    accept_dot_files: bool,
    all_disabled: bool,
    just_scanning: bool,
    delete_files_flag: u32,
    locked_file_time: i64,
    unknown_file_time: i64,
    ignore_size: i64,
    ignore_size_op: Compare,
    ignore_file_time: i64,
    ignore_file_time_op: Compare,
    max_copied_files: u32,
    max_copied_file_size: i64,
}

impl DirPolicy {
    fn snapshot(fra: &FraHandle, distributed_helper: bool) -> Self {
        let e = fra.entry();
        Self {
            policy: e.policy(),
            remove: e.remove != 0 || e.policy() == ReacquirePolicy::Remove,
            accept_dot_files: e.accept_dot_files != 0,
            all_disabled: e.dir_flag & ALL_DISABLED != 0,
            just_scanning: e.dir_flag & ONE_PROCESS_JUST_SCANNING != 0
                && !(distributed_helper || e.dir_flag & DISTRIBUTED_HELPER_JOB != 0),
            delete_files_flag: e.delete_files_flag,
            locked_file_time: e.locked_file_time,
            unknown_file_time: e.unknown_file_time,
            ignore_size: e.ignore_size,
            ignore_size_op: Compare::from_u8(e.ignore_size_op),
            ignore_file_time: e.ignore_file_time,
            ignore_file_time_op: Compare::from_u8(e.ignore_file_time_op),
            max_copied_files: e.max_copied_files,
            max_copied_file_size: e.max_copied_file_size,
        }
    }

    fn files_cap_reached(&self, assigned: u32) -> bool {
        self.max_copied_files != 0 && assigned + 1 >= self.max_copied_files
    }

    fn bytes_cap_reached(&self, bytes: i64, next: i64) -> bool {
        self.max_copied_file_size != 0 && next > 0 && bytes + next >= self.max_copied_file_size
    }
}

pub struct Scanner<'a> {
    pub fra: &'a mut FraHandle,
    pub fsa: &'a mut FsaHandle,
    pub rlist: &'a mut RlistHandle,
    pub sinks: &'a mut LogSinks,
    pub worker_id: u32,
    pub distributed_helper: bool,
}

impl Scanner<'_> {
    /// Run one reconcile pass over a fresh listing.
    pub fn scan(&mut self, source: &mut dyn RemoteSource) -> Result<ScanOutcome> {
        let names = source.list()?;
        let policy = DirPolicy::snapshot(self.fra, self.distributed_helper);
        let filter = FileFilter::parse(self.fra.entry().filters_str());
        let mut out = ScanOutcome::default();

        // pass marker: everything not seen again in this listing loses its
        // in_list bit and is collected at the end
        for i in 0..self.rlist.count() {
            self.rlist.entry_mut(i)?.in_list = 0;
        }

        for raw in &names {
            let name = raw.strip_prefix("./").unwrap_or(raw);
            if name.is_empty() {
                continue;
            }
            if name.len() > MAX_FILENAME_LENGTH - 1 {
                self.sinks.transfer(
                    Severity::Error,
                    &format!("name exceeds {} bytes, ignored: {:.64}...", MAX_FILENAME_LENGTH - 1, name),
                );
                continue;
            }
            if name.starts_with('.') && !policy.accept_dot_files {
                continue;
            }
            if policy.all_disabled {
                if policy.remove {
                    source.delete(name)?;
                    self.sinks.delete(name, DeleteReason::HostDisabled, -1);
                }
                continue;
            }
            if filter.accepts(name, Local::now()) {
                self.check_list(source, name, &policy, &mut out)?;
            } else {
                self.handle_rejected(source, name, &policy)?;
            }
        }

        // collect entries that fell out of the listing, except in the
        // policies where the list never outlives the cycle
        if !policy.remove && !policy.policy.is_get_once() {
            let proc = self.rlist.lock_proc()?;
            self.rlist.compact(&proc)?;
            drop(proc);
        }

        self.publish_totals(&out)?;
        Ok(out)
    }

    /// A name the filter turned down: stale dot-lock cleanup first, then
    /// the unknown-file rule. Both need an age, so a directory without the
    /// date probe keeps rejected files untouched.
    fn handle_rejected(
        &mut self,
        source: &mut dyn RemoteSource,
        name: &str,
        policy: &DirPolicy,
    ) -> Result<()> {
        let now = Local::now().timestamp();
        if name.starts_with('.') && policy.locked_file_time != -1 {
            let horizon = policy.locked_file_time.max(DEFAULT_TRANSFER_TIMEOUT);
            if let Probe::Known(mtime) = source.mtime(name)? {
                if now - mtime > horizon {
                    source.delete(name)?;
                    let reason = if policy.delete_files_flag & OLD_LOCKED_FILES != 0 {
                        DeleteReason::OldLockedDirOption
                    } else {
                        DeleteReason::OldRlockedGlobal
                    };
                    self.sinks.delete(name, reason, -1);
                }
            }
            return Ok(());
        }
        if policy.delete_files_flag & UNKNOWN_FILES != 0 && policy.unknown_file_time != -2 {
            // -1 keeps the system-wide default and its global reason code
            let (limit, reason) = if policy.unknown_file_time < 0 {
                (DEFAULT_TRANSFER_TIMEOUT, DeleteReason::UnknownGlobal)
            } else {
                (
                    policy.unknown_file_time.max(DEFAULT_TRANSFER_TIMEOUT),
                    DeleteReason::UnknownDirOption,
                )
            };
            if let Probe::Known(mtime) = source.mtime(name)? {
                if now - mtime > limit {
                    source.delete(name)?;
                    self.sinks.delete(name, reason, -1);
                }
            }
        }
        Ok(())
    }

    /// Look `name` up in the retrieve list and decide assignment. Probes
    /// run between lock windows, never inside one.
    fn check_list(
        &mut self,
        source: &mut dyn RemoteSource,
        name: &str,
        policy: &DirPolicy,
        out: &mut ScanOutcome,
    ) -> Result<()> {
        let existing = self.rlist.find(name)?;

        if let Some(idx) = existing {
            if !self.rlist.try_lock_entry(idx)? {
                // another worker owns this name for the current pass
                return Ok(());
            }
            let snapshot = {
                let e = self.rlist.entry_mut(idx)?;
                e.in_list = 1;
                (e.assigned, e.retrieved != 0, e.size, e.file_mtime, e.special_flag)
            };
            self.rlist.unlock_entry(idx)?;
            let (assigned, retrieved, old_size, old_mtime, special) = snapshot;
            if assigned != 0 {
                return Ok(());
            }
            if retrieved {
                match policy.policy {
                    ReacquirePolicy::GetOnceInexact => return Ok(()),
                    ReacquirePolicy::GetOnceExact if special & RL_GOT_SIZE_DATE != 0 => {
                        return Ok(());
                    }
                    _ => {}
                }
            }

            let (size, mtime, special_flag) = self.probe(source, name)?;
            let changed = (size != -1 && size != old_size) || (mtime != -1 && mtime != old_mtime);
            if retrieved && !changed {
                return Ok(());
            }
            if self.skip_by_ignore_rules(policy, size, mtime) {
                return Ok(());
            }

            if !self.rlist.try_lock_entry(idx)? {
                return Ok(());
            }
            let assign = self.assignment(policy, out, size);
            {
                let worker_id = self.worker_id;
                let e = self.rlist.entry_mut(idx)?;
                if e.assigned != 0 {
                    // lost the race between the two lock windows
                    self.rlist.unlock_entry(idx)?;
                    return Ok(());
                }
                if changed {
                    if policy.policy == ReacquirePolicy::AppendOnly
                        && size > e.size
                        && e.size > 0
                    {
                        e.prev_size = e.size;
                    } else {
                        e.prev_size = 0;
                    }
                    e.retrieved = 0;
                }
                if size != -1 {
                    e.size = size;
                }
                if mtime != -1 {
                    e.file_mtime = mtime;
                    e.got_date = 1;
                }
                e.special_flag = special_flag;
                if assign {
                    e.assigned = worker_id + 1;
                }
            }
            self.rlist.unlock_entry(idx)?;
            if assign {
                out.files_to_retrieve += 1;
                if size > 0 {
                    out.bytes_to_retrieve += size;
                }
            }
            return Ok(());
        }

        // new name: probe first, insert, then take the lock to assign
        let (size, mtime, special_flag) = self.probe(source, name)?;
        if self.skip_by_ignore_rules(policy, size, mtime) {
            // record it anyway so the next pass knows it
            self.rlist.insert(name, size, mtime, special_flag)?;
            return Ok(());
        }
        let idx = match self.rlist.find(name)? {
            // another worker slipped the same name in meanwhile
            Some(idx) => idx,
            None => self.rlist.insert(name, size, mtime, special_flag)?,
        };
        if !self.rlist.try_lock_entry(idx)? {
            return Ok(());
        }
        let assign = self.assignment(policy, out, size);
        {
            let worker_id = self.worker_id;
            let e = self.rlist.entry_mut(idx)?;
            e.in_list = 1;
            if assign && e.assigned == 0 && e.retrieved == 0 {
                e.assigned = worker_id + 1;
            }
        }
        self.rlist.unlock_entry(idx)?;
        if assign {
            out.files_to_retrieve += 1;
            if size > 0 {
                out.bytes_to_retrieve += size;
            }
        }
        Ok(())
    }

    /// Metadata probes under the session capability flags. -1 stands for
    /// unknown, mirroring the stored representation.
    fn probe(&mut self, source: &mut dyn RemoteSource, name: &str) -> Result<(i64, i64, u8)> {
        let mut special = 0u8;
        let size = if source.probe_size_supported() {
            match source.size(name)? {
                Probe::Known(s) => {
                    special |= RL_GOT_EXACT_SIZE;
                    s
                }
                Probe::NotSupported => -1,
            }
        } else {
            -1
        };
        let mtime = if source.probe_date_supported() {
            match source.mtime(name)? {
                Probe::Known(t) => {
                    special |= RL_GOT_EXACT_DATE;
                    t
                }
                Probe::NotSupported => -1,
            }
        } else {
            -1
        };
        if special & RL_GOT_EXACT_SIZE != 0 && special & RL_GOT_EXACT_DATE != 0 {
            special |= RL_GOT_SIZE_DATE;
        }
        Ok((size, mtime, special))
    }

    fn skip_by_ignore_rules(&self, policy: &DirPolicy, size: i64, mtime: i64) -> bool {
        if size != -1 && policy.ignore_size_op.matches(size, policy.ignore_size) {
            return true;
        }
        if mtime != -1 && policy.ignore_file_time_op != Compare::Off {
            let age = Local::now().timestamp() - mtime;
            if policy.ignore_file_time_op.matches(age, policy.ignore_file_time) {
                return true;
            }
        }
        false
    }

    /// Whether this candidate gets assigned to us, updating the overflow
    /// marker and the MAX_COPIED flag when a cap refuses it.
    fn assignment(&mut self, policy: &DirPolicy, out: &mut ScanOutcome, size: i64) -> bool {
        if policy.just_scanning {
            out.more_files_in_list = true;
            return false;
        }
        if policy.files_cap_reached(out.files_to_retrieve)
            || policy.bytes_cap_reached(out.bytes_to_retrieve, size)
        {
            out.more_files_in_list = true;
            self.fra.entry_mut().dir_flag |= MAX_COPIED;
            return false;
        }
        true
    }

    /// Push the pass result into the shared tables for observers and the
    /// fetch loop.
    fn publish_totals(&mut self, out: &ScanOutcome) -> Result<()> {
        {
            let _tfc = self.fsa.lock_tfc()?;
            let slot = self.fsa.job_slot();
            let e = self.fsa.entry_mut();
            e.total_file_counter += out.files_to_retrieve;
            e.total_file_size += out.bytes_to_retrieve;
            let job = &mut e.job_status[slot];
            job.no_of_files = out.files_to_retrieve;
            job.no_of_files_done = 0;
            job.file_size = out.bytes_to_retrieve;
            job.file_size_done = 0;
        }
        {
            let _tfc = self.fra.lock_tfc()?;
            let now = Local::now().timestamp();
            let e = self.fra.entry_mut();
            // monotone after a successful scan
            if now > e.last_retrieval {
                e.last_retrieval = now;
            }
        }
        Ok(())
    }
}

/// Outcome of trying to become the working process on a retrieve list
/// under a destructive policy (remove / get-once), where only one process
/// may touch the list per cycle.
pub enum ProcAdmission {
    /// Policy is not destructive, no serialisation needed.
    NotNeeded,
    /// We hold the process lock for this cycle.
    Held(crate::lock::RegionGuard),
    /// Another process is doing the work; exit `SUCCESS` without scanning.
    OtherProcessActive,
}

pub fn admit_destructive_scan(
    rlist: &RlistHandle,
    policy: ReacquirePolicy,
    remove: bool,
) -> Result<ProcAdmission> {
    if !(remove || policy.is_get_once() || policy == ReacquirePolicy::Remove) {
        return Ok(ProcAdmission::NotNeeded);
    }
    match rlist.lock_proc_for_helper()? {
        Some(guard) => Ok(ProcAdmission::Held(guard)),
        None => Ok(ProcAdmission::OtherProcessActive),
    }
}
