//! Transfer, delete and event log sinks, plus the error-state transitions
//! they announce.
//!
//! These files are a wire contract for external observers (log shippers,
//! dashboards), so the line format is fixed: a 16-byte header
//! `DD HH:MM:SS SGN `, the host alias right-padded to the display width,
//! `[worker]:`, the message, and an optional ` (file line)` origin on
//! debug and transient lines. Diagnostics that are ours alone go through
//! `tracing` instead.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use chrono::Local;

use crate::table::fra::{DIR_ERROR_SET, FraHandle};
use crate::table::fsa::{
    AUTO_PAUSE_QUEUE_STAT, DISCONNECTED, FsaHandle, HOST_ERROR_ACKNOWLEDGED,
    HOST_ERROR_ACKNOWLEDGED_T, HOST_ERROR_OFFLINE, HOST_ERROR_OFFLINE_T, MAX_HOSTNAME_LENGTH,
    NOT_WORKING,
};

/// Severity sign carried in the fixed log header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
    /// Host is acknowledged/offlined: events keep flowing but are marked
    /// so observers do not re-alert.
    Offline,
    Debug,
}

impl Severity {
    fn sign(self) -> &'static str {
        match self {
            Self::Info => "<I>",
            Self::Warn => "<W>",
            Self::Error => "<E>",
            Self::Offline => "<O>",
            Self::Debug => "<D>",
        }
    }
}

/// Reason codes recorded with every delete line. The integers are stable
/// across releases; downstream accounting keys on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeleteReason {
    AgeLimitOut = 0,
    AgeLimitIn = 1,
    UserRequest = 2,
    ExecFailedDelete = 3,
    UnreadableMessages = 4,
    DupCheckIn = 5,
    DupCheckOut = 6,
    UnknownDirOption = 7,
    LocateJobFailed = 8,
    OldLockedDirOption = 9,
    QueuedDirOption = 10,
    DeleteOption = 11,
    StaleErrorJobs = 12,
    StaleAfterDbUpdate = 13,
    TransmittedByPeer = 14,
    UnknownPoolDir = 15,
    ExecFailedStored = 16,
    HostDisabled = 17,
    ConversionFailed = 18,
    RenameOverwrite = 19,
    MailRejected = 20,
    MirrorDelete = 21,
    MkdirQueueError = 22,
    InternalLinkFailed = 23,
    UnreadableFile = 24,
    UnknownGlobal = 25,
    OldLockedGlobal = 26,
    OldRlockedGlobal = 27,
    QueuedGlobal = 28,
    OldLockedIncomingGlobal = 29,
}

impl DeleteReason {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The fixed 16-byte line header: `DD HH:MM:SS SGN `.
pub fn log_header(severity: Severity) -> String {
    format!("{} {} ", Local::now().format("%d %H:%M:%S"), severity.sign())
}

fn format_line(
    severity: Severity,
    host_alias: &str,
    worker: usize,
    msg: &str,
    origin: Option<(&str, u32)>,
) -> String {
    let mut line = format!(
        "{}{:<width$}[{}]: {}",
        log_header(severity),
        host_alias,
        worker,
        msg,
        width = MAX_HOSTNAME_LENGTH
    );
    if let Some((file, lineno)) = origin {
        line.push_str(&format!(" ({} {})", file, lineno));
    }
    line
}

/// Append-mode sinks under `<workdir>/log/`. One instance per worker; the
/// files are shared between workers and lines are written whole.
pub struct LogSinks {
    transfer: File,
    delete: File,
    event: File,
    host_alias: String,
    worker: usize,
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

impl LogSinks {
    pub fn open(workdir: &Path, host_alias: &str, worker: usize) -> Result<Self> {
        let log_dir = workdir.join("log");
        Ok(Self {
            transfer: open_append(&log_dir.join("transfer.log"))?,
            delete: open_append(&log_dir.join("delete.log"))?,
            event: open_append(&log_dir.join("event.log"))?,
            host_alias: host_alias.to_string(),
            worker,
        })
    }

    pub fn transfer(&mut self, severity: Severity, msg: &str) {
        let line = format_line(severity, &self.host_alias, self.worker, msg, None);
        let _ = writeln!(self.transfer, "{}", line);
    }

    pub fn transfer_with_origin(&mut self, severity: Severity, msg: &str, file: &str, line_no: u32) {
        let line =
            format_line(severity, &self.host_alias, self.worker, msg, Some((file, line_no)));
        let _ = writeln!(self.transfer, "{}", line);
    }

    /// `name|reason|size|alias` after the fixed header; reason is the
    /// stable integer code.
    pub fn delete(&mut self, file_name: &str, reason: DeleteReason, size: i64) {
        let msg = format!("{}|{}|{}|{}", file_name, reason.code(), size, self.host_alias);
        let line = format_line(Severity::Info, &self.host_alias, self.worker, &msg, None);
        let _ = writeln!(self.delete, "{}", line);
    }

    pub fn event(&mut self, severity: Severity, msg: &str) {
        let line = format_line(severity, &self.host_alias, self.worker, msg, None);
        let _ = writeln!(self.event, "{}", line);
    }

    pub fn flush(&mut self) {
        let _ = self.transfer.flush();
        let _ = self.delete.flush();
        let _ = self.event.flush();
    }
}

/// First successful fetch after host errors: zero the counter and the
/// recent history under `LOCK_EC`, wake sibling slots parked on
/// NOT_WORKING, clear the auto-pause state and its event window under
/// `LOCK_HS`, and announce `ERROR_END`, with offline severity when an
/// operator has acknowledged or offlined the host.
pub fn clear_host_error(fsa: &mut FsaHandle, sinks: &mut LogSinks) -> Result<()> {
    if fsa.entry().error_counter == 0 {
        return Ok(());
    }
    {
        let _ec = fsa.lock_ec()?;
        let e = fsa.entry_mut();
        e.error_counter = 0;
        e.error_history[0] = 0;
        e.error_history[1] = 0;
    }
    {
        let e = fsa.entry_mut();
        for job in e.job_status.iter_mut() {
            if job.connect_status == NOT_WORKING {
                job.connect_status = DISCONNECTED;
            }
        }
    }
    let offline = {
        let _hs = fsa.lock_hs()?;
        let e = fsa.entry_mut();
        e.host_status &= !AUTO_PAUSE_QUEUE_STAT;
        e.start_event_handle = 0;
        e.end_event_handle = 0;
        e.host_status
            & (HOST_ERROR_ACKNOWLEDGED
                | HOST_ERROR_ACKNOWLEDGED_T
                | HOST_ERROR_OFFLINE
                | HOST_ERROR_OFFLINE_T)
            != 0
    };
    let severity = if offline { Severity::Offline } else { Severity::Info };
    sinks.event(severity, "ERROR_END host");
    Ok(())
}

/// Directory-side counterpart of [`clear_host_error`].
pub fn clear_dir_error(fra: &mut FraHandle, sinks: &mut LogSinks) -> Result<()> {
    if fra.entry().error_counter == 0 && fra.entry().dir_flag & DIR_ERROR_SET == 0 {
        return Ok(());
    }
    {
        let _ec = fra.lock_ec()?;
        let e = fra.entry_mut();
        e.error_counter = 0;
        e.dir_flag &= !DIR_ERROR_SET;
    }
    sinks.event(Severity::Info, "ERROR_END directory");
    Ok(())
}

/// Failed cycle: bump the counters and raise the error flags once the
/// directory limit is crossed.
pub fn record_failure(
    fra: &mut FraHandle,
    fsa: &mut FsaHandle,
    sinks: &mut LogSinks,
    msg: &str,
) -> Result<()> {
    let crossed = {
        let _ec = fra.lock_ec()?;
        let e = fra.entry_mut();
        if e.error_counter < e.max_errors {
            e.error_counter += 1;
        }
        let crossed = e.error_counter >= e.max_errors && e.dir_flag & DIR_ERROR_SET == 0;
        if crossed {
            e.dir_flag |= DIR_ERROR_SET;
        }
        crossed
    };
    {
        let _ec = fsa.lock_ec()?;
        let e = fsa.entry_mut();
        e.error_counter = e.error_counter.saturating_add(1);
        e.error_history.rotate_right(1);
        e.error_history[0] = 1;
    }
    sinks.transfer(Severity::Error, msg);
    if crossed {
        sinks.event(Severity::Error, "ERROR_START directory");
    }
    Ok(())
}
