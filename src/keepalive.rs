//! Between scan cycles: stay connected, or close the session and leave
//! the next cycle to a fresh worker.
//!
//! The wait is a select on (timer, cancel channel) rather than an
//! interruptible sleep: each chunk ends with a keep-alive ping, a
//! re-verification that the shared tables still address our directory and
//! host, and a look at the supervisor's cancel byte.

use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::FetchError;
use crate::remote::RemoteSource;
use crate::table::TableCheck;
use crate::table::fra::FraHandle;
use crate::table::fsa::{DONT_KEEP_CONNECTION, FsaHandle};
use crate::timeentry;

/// Ping cadence while holding a session open, seconds.
pub const DEFAULT_NOOP_INTERVAL: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepAliveDecision {
    /// Loop straight into another scan on the open session.
    ScanAgain,
    /// Close the session; the supervisor schedules the next check.
    Disconnect,
}

pub struct Arbiter<'a> {
    pub fra: &'a mut FraHandle,
    pub fsa: &'a mut FsaHandle,
    /// Fed by the signal handler; one message means wind down now.
    pub cancel: &'a Receiver<()>,
}

impl Arbiter<'_> {
    /// Decide what happens after a drained scan cycle.
    pub fn decide(
        &mut self,
        source: &mut dyn RemoteSource,
        more_files_in_list: bool,
    ) -> Result<KeepAliveDecision> {
        if more_files_in_list {
            return Ok(KeepAliveDecision::ScanAgain);
        }

        let now = Local::now().timestamp();
        let keep_connected = self.keep_connected_window();
        let timeup = now + i64::from(keep_connected);
        let next_check = self.compute_next_check(now);
        {
            let e = self.fra.entry_mut();
            e.next_check_time = next_check.max(0);
        }
        if next_check > timeup {
            return Ok(KeepAliveDecision::Disconnect);
        }

        let transfer_timeout = i64::from(self.fsa.entry().transfer_timeout);
        loop {
            if self.fsa.cancel_requested() {
                return Ok(KeepAliveDecision::Disconnect);
            }
            let now = Local::now().timestamp();
            if now >= next_check {
                return Ok(KeepAliveDecision::ScanAgain);
            }
            if now >= timeup {
                return Ok(KeepAliveDecision::Disconnect);
            }
            let chunk = (transfer_timeout - 5)
                .min(DEFAULT_NOOP_INTERVAL as i64)
                .min(timeup - now)
                .min(next_check - now)
                .max(1) as u64;
            match self.cancel.recv_timeout(Duration::from_secs(chunk)) {
                Ok(()) => return Err(FetchError::GotKilled.into()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // handler side dropped; fall back to plain timing
                }
            }
            if self.fsa.cancel_requested() {
                return Ok(KeepAliveDecision::Disconnect);
            }
            // the tables may have been rebuilt while we slept
            if self.fra.check() == TableCheck::Gone {
                return Err(FetchError::StaleHandle("directory".into()).into());
            }
            if self.fsa.check() == TableCheck::Gone {
                return Err(FetchError::StaleHandle("host".into()).into());
            }
            source.noop()?;
        }
    }

    /// Directory value when set, else the host's unless the host refuses
    /// kept fetch connections.
    fn keep_connected_window(&self) -> u32 {
        let dir = self.fra.entry().keep_connected;
        if dir > 0 {
            return dir;
        }
        let e = self.fsa.entry();
        if e.host_status & DONT_KEEP_CONNECTION != 0 {
            0
        } else {
            // host-side default rides in transfer_timeout multiples; a
            // host that allows keeping the connection grants one interval
            e.transfer_timeout
        }
    }

    fn compute_next_check(&self, now: i64) -> i64 {
        let e = self.fra.entry();
        let entries = &e.time_entries[..e.no_of_time_entries.min(4) as usize];
        if entries.iter().any(|t| t.in_use != 0) {
            if let Some(at) = timeentry::next_fire_unix(entries, now) {
                return at;
            }
        }
        now + i64::from(e.remote_file_check_interval.max(1))
    }
}
