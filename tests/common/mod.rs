//! Shared scaffolding for the integration tests: a scripted remote source
//! and a disposable work area with seeded tables.

// each test binary uses its own slice of this module
#![allow(dead_code)]

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use getferry::remote::{Probe, RemoteSource};
use getferry::report::LogSinks;
use getferry::rlist::{AttachMode, RlistHandle};
use getferry::table::fra::{self, FraEntry, FraHandle};
use getferry::table::fsa::{self, FsaEntry, FsaHandle};

static AREA_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct MockFile {
    pub name: String,
    pub mtime: i64,
    pub body: Vec<u8>,
}

impl MockFile {
    pub fn new(name: &str, mtime: i64, body: &[u8]) -> Self {
        Self { name: name.to_string(), mtime, body: body.to_vec() }
    }
}

/// Scripted stand-in for a connected session. Listing order is the vec
/// order; names may carry a `./` prefix to exercise the strip rule.
pub struct MockSource {
    pub files: Vec<MockFile>,
    pub date_supported: bool,
    pub size_supported: bool,
    pub deleted: Vec<String>,
    pub retrieves: Vec<(String, i64)>,
    pub noops: u32,
}

impl MockSource {
    pub fn new(files: Vec<MockFile>) -> Self {
        Self {
            files,
            date_supported: true,
            size_supported: true,
            deleted: Vec::new(),
            retrieves: Vec::new(),
            noops: 0,
        }
    }

    fn lookup(&self, name: &str) -> Option<&MockFile> {
        let plain = name.strip_prefix("./").unwrap_or(name);
        self.files.iter().find(|f| f.name.strip_prefix("./").unwrap_or(&f.name) == plain)
    }
}

impl RemoteSource for MockSource {
    fn list(&mut self) -> Result<Vec<String>> {
        Ok(self.files.iter().map(|f| f.name.clone()).collect())
    }

    fn mtime(&mut self, name: &str) -> Result<Probe<i64>> {
        if !self.date_supported {
            return Ok(Probe::NotSupported);
        }
        match self.lookup(name) {
            Some(f) => Ok(Probe::Known(f.mtime)),
            None => Ok(Probe::NotSupported),
        }
    }

    fn size(&mut self, name: &str) -> Result<Probe<i64>> {
        if !self.size_supported {
            return Ok(Probe::NotSupported);
        }
        match self.lookup(name) {
            Some(f) => Ok(Probe::Known(f.body.len() as i64)),
            None => Ok(Probe::NotSupported),
        }
    }

    fn retrieve(&mut self, name: &str, offset: i64) -> Result<Box<dyn std::io::Read + Send>> {
        self.retrieves.push((name.to_string(), offset));
        let f = self
            .lookup(name)
            .unwrap_or_else(|| panic!("retrieve of unknown file {}", name));
        let body = f.body.get(offset as usize..).unwrap_or(&[]).to_vec();
        Ok(Box::new(Cursor::new(body)))
    }

    fn retrieve_done(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        let plain = name.strip_prefix("./").unwrap_or(name).to_string();
        self.files.retain(|f| f.name.strip_prefix("./").unwrap_or(&f.name) != plain);
        self.deleted.push(plain);
        Ok(())
    }

    fn noop(&mut self) -> Result<()> {
        self.noops += 1;
        Ok(())
    }

    fn quit(&mut self) -> Result<()> {
        Ok(())
    }

    fn probe_date_supported(&self) -> bool {
        self.date_supported
    }

    fn probe_size_supported(&self) -> bool {
        self.size_supported
    }
}

/// Disposable work area; removed on drop.
pub struct TestArea {
    pub workdir: PathBuf,
}

impl Drop for TestArea {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.workdir);
    }
}

pub fn unique_workdir(tag: &str) -> TestArea {
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let pid = std::process::id();
    let cnt = AREA_COUNTER.fetch_add(1, Ordering::Relaxed);
    let workdir =
        std::env::temp_dir().join(format!("gf_it_{}_{}_{}_{}", tag, now_ns, pid, cnt));
    std::fs::create_dir_all(&workdir).expect("create work area");
    TestArea { workdir }
}

/// Everything a Scanner / Fetcher needs, seeded with one directory on one
/// host. The closures adjust the seed entries before the tables are
/// written.
pub struct Harness {
    pub area: TestArea,
    pub fra: FraHandle,
    pub fsa: FsaHandle,
    pub rlist: RlistHandle,
    pub sinks: LogSinks,
}

pub fn harness(
    tag: &str,
    fra_mod: impl FnOnce(&mut FraEntry),
    fsa_mod: impl FnOnce(&mut FsaEntry),
) -> Harness {
    let area = unique_workdir(tag);
    let mut d = FraEntry::zeroed();
    d.set_alias("feed");
    d.set_url("ftp://mirror.example.net/pub/feed");
    d.set_filters("*");
    d.dir_id = 1;
    d.host_id = 1;
    d.fsa_pos = 0;
    d.max_errors = 10;
    d.remote_file_check_interval = 180;
    d.locked_file_time = -1;
    d.unknown_file_time = -1;
    d.ignore_size = -1;
    d.ignore_file_time = -1;
    fra_mod(&mut d);

    let mut h = FsaEntry::zeroed();
    h.set_alias("mx");
    h.set_real_hostname(0, "mirror.example.net");
    h.host_id = 1;
    h.allowed_transfers = 4;
    fsa_mod(&mut h);

    let fra_path = area.workdir.join("fra");
    let fsa_path = area.workdir.join("fsa");
    fra::create(&fra_path, &[d]).expect("create fra");
    fsa::create(&fsa_path, &[h]).expect("create fsa");

    let fra_h = FraHandle::attach(&fra_path, "feed").expect("attach fra");
    let fsa_h = FsaHandle::attach(&fsa_path, 0, 1, 0).expect("attach fsa");
    let rlist = RlistHandle::attach(&area.workdir.join("rl").join("1"), AttachMode::CreateIfMissing)
        .expect("attach rlist");
    let sinks = LogSinks::open(&area.workdir, "mx", 0).expect("sinks");
    Harness { area, fra: fra_h, fsa: fsa_h, rlist, sinks }
}

/// Snapshot of the retrieve list for idempotence checks: name, size,
/// mtime, retrieved, assigned.
pub fn rlist_snapshot(rlist: &mut RlistHandle) -> Vec<(String, i64, i64, u8, u32)> {
    let mut rows = Vec::new();
    for i in 0..rlist.count() {
        let e = rlist.entry(i).expect("entry");
        rows.push((e.name().to_string(), e.size, e.file_mtime, e.retrieved, e.assigned));
    }
    rows.sort();
    rows
}
