//! Drain the entries a scan assigned to this worker.
//!
//! Each file streams into a dot-prefixed staging path in block-size
//! chunks, throttled to the per-process rate share, fsynced, then renamed
//! into the incoming queue. The assignment bit is the ownership token:
//! a worker never touches an entry carrying another worker's mark, and the
//! bit is only cleared after the rename has happened.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::FetchError;
use crate::remote::RemoteSource;
use crate::report::{self, LogSinks, Severity};
use crate::rlist::RlistHandle;
use crate::table::fra::{FraHandle, ReacquirePolicy};
use crate::table::fsa::{CONNECTED, FsaHandle, RETRIEVING};
use crate::table::set_fixed_str;
use crate::throttle::RateLimiter;

#[derive(Clone, Copy, Debug, Default)]
pub struct FetchOutcome {
    pub files_fetched: u32,
    pub bytes_fetched: u64,
}

struct Assignment {
    idx: usize,
    name: String,
    size: i64,
    prev_size: i64,
}

pub struct Fetcher<'a> {
    pub fra: &'a mut FraHandle,
    pub fsa: &'a mut FsaHandle,
    pub rlist: &'a mut RlistHandle,
    pub sinks: &'a mut LogSinks,
    pub worker_id: u32,
    pub staging_dir: PathBuf,
    /// Signal-handler channel; a message aborts the stream mid-chunk.
    pub cancel: &'a crossbeam_channel::Receiver<()>,
}

impl Fetcher<'_> {
    /// Traverse the retrieve list and fetch everything assigned to us.
    /// The traversal bound is re-read every iteration; when it shrinks
    /// below what we cached, another worker compacted and this pass ends.
    pub fn drain(&mut self, source: &mut dyn RemoteSource) -> Result<FetchOutcome> {
        std::fs::create_dir_all(&self.staging_dir).map_err(|e| {
            FetchError::OpenLocalError(self.staging_dir.clone(), e.to_string())
        })?;
        let mut out = FetchOutcome::default();
        let mut limiter = RateLimiter::new(0);
        let cached_bound = self.rlist.count();
        let mut idx = 0usize;
        loop {
            let count = self.rlist.count();
            if count < cached_bound {
                // compaction moved the ground under us: abort this pass
                break;
            }
            if idx >= count {
                break;
            }
            let claim = self.claim(idx)?;
            if let Some(assignment) = claim {
                self.fetch_one(source, &assignment, &mut limiter, &mut out)?;
            }
            idx += 1;
        }
        Ok(out)
    }

    /// Read the assignment mark under the entry lock; ours means we own
    /// the entry until we clear it.
    fn claim(&mut self, idx: usize) -> Result<Option<Assignment>> {
        if !self.rlist.try_lock_entry(idx)? {
            return Ok(None);
        }
        let claimed = {
            let e = self.rlist.entry(idx)?;
            if e.assigned == self.worker_id + 1 {
                Some(Assignment {
                    idx,
                    name: e.name().to_string(),
                    size: e.size,
                    prev_size: e.prev_size,
                })
            } else {
                None
            }
        };
        self.rlist.unlock_entry(idx)?;
        Ok(claimed)
    }

    fn fetch_one(
        &mut self,
        source: &mut dyn RemoteSource,
        assignment: &Assignment,
        limiter: &mut RateLimiter,
        out: &mut FetchOutcome,
    ) -> Result<()> {
        let policy = self.fra.entry().policy();
        let remove_after = self.fra.entry().remove != 0 || policy == ReacquirePolicy::Remove;
        let (timeout, block_size, trl) = {
            let e = self.fsa.entry();
            (
                Duration::from_secs(u64::from(e.transfer_timeout.max(1))),
                (e.block_size.max(1024)) as usize,
                e.trl_per_process,
            )
        };

        let (tmp_path, final_path) = staging_paths(&self.staging_dir, &assignment.name);

        // append restart: resume from a partial body, or pull the already
        // delivered file back into staging and fetch only the grown tail
        let mut append =
            policy == ReacquirePolicy::AppendOnly && assignment.prev_size > 0 && tmp_path.exists();
        if policy == ReacquirePolicy::AppendOnly
            && assignment.prev_size > 0
            && !append
            && final_path.exists()
        {
            std::fs::rename(&final_path, &tmp_path)
                .map_err(|e| FetchError::OpenLocalError(tmp_path.clone(), e.to_string()))?;
            append = true;
        }
        let offset = if append { assignment.prev_size } else { 0 };

        let mut local = if append {
            OpenOptions::new().append(true).open(&tmp_path)
        } else {
            OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)
        }
        .map_err(|e| FetchError::OpenLocalError(tmp_path.clone(), e.to_string()))?;

        limiter.reset(if trl > 0 { trl as u64 } else { 0 });
        {
            let job = self.fsa.job_mut();
            set_fixed_str(&mut job.file_name_in_use, &assignment.name);
            job.file_size_in_use = assignment.size.max(0);
            job.file_size_in_use_done = offset;
            job.connect_status = RETRIEVING;
        }
        self.sinks.transfer(
            Severity::Debug,
            &format!("OPEN {} offset {}", assignment.name, offset),
        );

        let started = Instant::now();
        let observed = match self.stream_body(
            source,
            &assignment.name,
            offset,
            &mut local,
            limiter,
            block_size,
            timeout,
            started,
        ) {
            Ok(n) => n,
            Err(e) => {
                drop(local);
                // a partial body is only worth keeping when append mode can
                // resume from it
                if policy != ReacquirePolicy::AppendOnly {
                    let _ = std::fs::remove_file(&tmp_path);
                }
                self.fsa.job_mut().connect_status = CONNECTED;
                return Err(e);
            }
        };

        local
            .sync_all()
            .map_err(|e| FetchError::WriteLocalError(tmp_path.clone(), e.to_string()))?;
        drop(local);
        source.retrieve_done()?;

        if remove_after {
            source.delete(&assignment.name)?;
        }

        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| FetchError::WriteLocalError(final_path.clone(), e.to_string()))?;

        let total_local = offset + observed as i64;
        {
            // the assignment mark makes the entry ours; the lock only
            // fences the field writes against observer probes
            let guard = self.rlist.lock_entry(assignment.idx)?;
            let e = self.rlist.entry_mut(assignment.idx)?;
            e.retrieved = 1;
            e.assigned = 0;
            e.prev_size = 0;
            e.size = total_local;
            drop(guard);
        }

        self.fsa.file_done(assignment.size.max(0), total_local)?;
        {
            let _tfc = self.fra.lock_tfc()?;
            let e = self.fra.entry_mut();
            e.bytes_received += observed;
            e.files_received += 1;
        }
        self.fsa.job_mut().connect_status = CONNECTED;
        out.files_fetched += 1;
        out.bytes_fetched += observed;
        self.sinks.transfer(
            Severity::Info,
            &format!(
                "SUCCESS {} {} bytes in {:.1}s",
                assignment.name,
                observed,
                started.elapsed().as_secs_f64()
            ),
        );

        // the first good file after trouble clears the error state
        report::clear_host_error(self.fsa, self.sinks)?;
        report::clear_dir_error(self.fra, self.sinks)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_body(
        &mut self,
        source: &mut dyn RemoteSource,
        name: &str,
        offset: i64,
        local: &mut File,
        limiter: &mut RateLimiter,
        block_size: usize,
        timeout: Duration,
        started: Instant,
    ) -> Result<u64> {
        let mut remote = source.retrieve(name, offset)?;
        let mut buf = vec![0u8; block_size];
        let mut observed: u64 = 0;
        loop {
            if self.fsa.cancel_requested() || self.cancel.try_recv().is_ok() {
                return Err(FetchError::GotKilled.into());
            }
            if started.elapsed() > timeout {
                return Err(FetchError::StillFilesToSend(name.to_string()).into());
            }
            let n = match remote.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    return Err(
                        FetchError::ReadRemoteError(name.to_string(), e.to_string()).into()
                    );
                }
            };
            local.write_all(&buf[..n]).map_err(|e| {
                FetchError::WriteLocalError(
                    self.staging_dir.join(format!(".{}", name)),
                    e.to_string(),
                )
            })?;
            observed += n as u64;
            if limiter.is_active() {
                limiter.register(n as u64);
            }
            self.fsa.add_chunk(n as u64)?;
        }
        Ok(observed)
    }
}

/// Compose the staging paths for one file name (the dot prefix hides the
/// in-flight body from downstream pickup).
pub fn staging_paths(staging_dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (staging_dir.join(format!(".{}", name)), staging_dir.join(name))
}
