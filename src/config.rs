//! Work area layout and the job seed file.
//!
//! All state a worker touches lives under the working directory passed on
//! the command line. The shared tables normally exist before a worker
//! starts (the supervisor owns them); on a fresh work area they are
//! materialised once from `etc/jobs.json`, the same way a first run of a
//! new installation writes its initial configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::table::fra::{self, Compare, FraEntry, MAX_TIME_ENTRIES, ReacquirePolicy};
use crate::table::fsa::{self, DONT_KEEP_CONNECTION, FsaEntry};
use crate::timeentry;

#[derive(Clone, Debug)]
pub struct WorkArea {
    pub workdir: PathBuf,
}

impl WorkArea {
    pub fn new(workdir: &Path) -> Self {
        Self { workdir: workdir.to_path_buf() }
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.workdir.join("etc").join("jobs.json")
    }

    pub fn fra_path(&self) -> PathBuf {
        self.workdir.join("fra")
    }

    pub fn fsa_path(&self) -> PathBuf {
        self.workdir.join("fsa")
    }

    pub fn rlist_path(&self, dir_id: u32) -> PathBuf {
        self.workdir.join("rl").join(dir_id.to_string())
    }

    pub fn staging_dir(&self, dir_alias: &str) -> PathBuf {
        self.workdir.join("files").join(dir_alias)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.workdir.join("log")
    }

    /// Make sure the tables exist, seeding them from the job file when the
    /// work area is fresh.
    pub fn ensure_tables(&self) -> Result<()> {
        if self.fra_path().exists() && self.fsa_path().exists() {
            return Ok(());
        }
        let jobs = JobsFile::load(&self.jobs_path())?;
        let (fra_entries, fsa_entries) = jobs.build_entries()?;
        if !self.fsa_path().exists() {
            fsa::create(&self.fsa_path(), &fsa_entries)?;
        }
        if !self.fra_path().exists() {
            fra::create(&self.fra_path(), &fra_entries)?;
        }
        Ok(())
    }
}

fn default_allowed_transfers() -> u32 {
    2
}

fn default_transfer_timeout() -> u32 {
    120
}

fn default_block_size() -> u32 {
    4096
}

fn default_check_interval() -> u32 {
    180
}

fn default_max_errors() -> u32 {
    10
}

fn default_minus_one() -> i64 {
    -1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostSeed {
    pub alias: String,
    pub host_id: u32,
    /// One hostname, or two for toggled host pairs.
    pub real_hostname: Vec<String>,
    #[serde(default = "default_allowed_transfers")]
    pub allowed_transfers: u32,
    #[serde(default)]
    pub transfer_rate_limit: i64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout: u32,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub keep_connection: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirSeed {
    pub alias: String,
    pub dir_id: u32,
    pub host_alias: String,
    pub url: String,
    /// One string per mask group (masks comma-separated, `!` rejects).
    pub filters: Vec<String>,
    #[serde(default)]
    pub policy: Option<ReacquirePolicy>,
    #[serde(default)]
    pub remove: bool,
    #[serde(default)]
    pub accept_dot_files: bool,
    #[serde(default)]
    pub delete_unknown_files: bool,
    #[serde(default)]
    pub delete_old_locked_files: bool,
    #[serde(default)]
    pub delete_old_rlocked_files: bool,
    #[serde(default)]
    pub ignore_size: Option<i64>,
    #[serde(default)]
    pub ignore_size_op: Option<Compare>,
    #[serde(default)]
    pub ignore_file_time: Option<i64>,
    #[serde(default)]
    pub ignore_file_time_op: Option<Compare>,
    #[serde(default)]
    pub max_copied_files: u32,
    #[serde(default)]
    pub max_copied_file_size: i64,
    #[serde(default = "default_minus_one")]
    pub locked_file_time: i64,
    #[serde(default = "default_minus_one")]
    pub unknown_file_time: i64,
    #[serde(default)]
    pub keep_connected: u32,
    #[serde(default = "default_check_interval")]
    pub remote_file_check_interval: u32,
    /// Cron-style `"M H DoM Mon DoW"` expressions, up to four.
    #[serde(default)]
    pub time_entries: Vec<String>,
    #[serde(default)]
    pub timezone: String,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default)]
    pub one_process_just_scanning: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsFile {
    pub hosts: Vec<HostSeed>,
    pub directories: Vec<DirSeed>,
}

impl JobsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FetchError::Incorrect(format!("cannot read job file {}: {}", path.display(), e))
        })?;
        let jobs: JobsFile = serde_json::from_str(&raw)
            .with_context(|| format!("malformed job file {}", path.display()))?;
        Ok(jobs)
    }

    /// Flatten the seed into mapped table entries.
    pub fn build_entries(&self) -> Result<(Vec<FraEntry>, Vec<FsaEntry>)> {
        let mut fsa_entries = Vec::with_capacity(self.hosts.len());
        for h in &self.hosts {
            let mut e = FsaEntry::zeroed();
            e.set_alias(&h.alias);
            if h.real_hostname.is_empty() {
                return Err(FetchError::Incorrect(format!(
                    "host {} has no real hostname",
                    h.alias
                ))
                .into());
            }
            for (side, name) in h.real_hostname.iter().take(2).enumerate() {
                e.set_real_hostname(side, name);
            }
            e.host_id = h.host_id;
            e.allowed_transfers = h.allowed_transfers.max(1);
            e.transfer_rate_limit = h.transfer_rate_limit;
            e.trl_per_process = h.transfer_rate_limit;
            e.transfer_timeout = h.transfer_timeout.max(10);
            e.block_size = h.block_size.max(1024);
            e.auto_toggle = u8::from(h.real_hostname.len() > 1);
            if !h.keep_connection {
                e.host_status |= DONT_KEEP_CONNECTION;
            }
            fsa_entries.push(e);
        }

        let mut fra_entries = Vec::with_capacity(self.directories.len());
        for d in &self.directories {
            let fsa_pos = self
                .hosts
                .iter()
                .position(|h| h.alias == d.host_alias)
                .ok_or_else(|| {
                    FetchError::Incorrect(format!(
                        "directory {} names unknown host {}",
                        d.alias, d.host_alias
                    ))
                })?;
            if d.time_entries.len() > MAX_TIME_ENTRIES {
                return Err(FetchError::Incorrect(format!(
                    "directory {} carries more than {} time entries",
                    d.alias, MAX_TIME_ENTRIES
                ))
                .into());
            }
            let mut e = FraEntry::zeroed();
            e.set_alias(&d.alias);
            e.set_url(&d.url);
            e.set_filters(&d.filters.join("\n"));
            e.set_timezone(&d.timezone);
            e.dir_id = d.dir_id;
            e.host_id = self.hosts[fsa_pos].host_id;
            e.fsa_pos = fsa_pos as i32;
            e.policy = d.policy.unwrap_or(ReacquirePolicy::None).as_u8();
            e.remove = u8::from(d.remove);
            e.accept_dot_files = u8::from(d.accept_dot_files);
            e.delete_files_flag = u32::from(d.delete_unknown_files) * fra::UNKNOWN_FILES
                | u32::from(d.delete_old_locked_files) * fra::OLD_LOCKED_FILES
                | u32::from(d.delete_old_rlocked_files) * fra::OLD_RLOCKED_FILES;
            e.ignore_size = d.ignore_size.unwrap_or(-1);
            e.ignore_size_op =
                d.ignore_size_op.unwrap_or(Compare::Off).as_u8();
            e.ignore_file_time = d.ignore_file_time.unwrap_or(-1);
            e.ignore_file_time_op = d.ignore_file_time_op.unwrap_or(Compare::Off).as_u8();
            e.max_copied_files = d.max_copied_files;
            e.max_copied_file_size = d.max_copied_file_size;
            e.locked_file_time = d.locked_file_time;
            e.unknown_file_time = d.unknown_file_time;
            e.keep_connected = d.keep_connected;
            e.remote_file_check_interval = d.remote_file_check_interval.max(1);
            e.max_errors = d.max_errors.max(1);
            if d.one_process_just_scanning {
                e.dir_flag |= fra::ONE_PROCESS_JUST_SCANNING;
            }
            for (slot, expr) in d.time_entries.iter().enumerate() {
                e.time_entries[slot] = timeentry::parse(expr)
                    .with_context(|| format!("directory {} time entry '{}'", d.alias, expr))?;
            }
            e.no_of_time_entries = d.time_entries.len() as u32;
            fra_entries.push(e);
        }
        Ok((fra_entries, fsa_entries))
    }
}
