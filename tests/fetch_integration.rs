mod common;

use std::time::Duration;

use common::{MockFile, MockSource, harness};
use crossbeam_channel::unbounded;
use getferry::FetchError;
use getferry::fetch::Fetcher;
use getferry::remote::RemoteSource;
use getferry::scan::Scanner;
use getferry::table::fra::ReacquirePolicy;

fn run_cycle(h: &mut common::Harness, src: &mut dyn RemoteSource) -> getferry::fetch::FetchOutcome {
    {
        let mut scanner = Scanner {
            fra: &mut h.fra,
            fsa: &mut h.fsa,
            rlist: &mut h.rlist,
            sinks: &mut h.sinks,
            worker_id: 0,
            distributed_helper: false,
        };
        scanner.scan(src).expect("scan");
    }
    let (_tx, rx) = unbounded();
    let staging = h.area.workdir.join("files").join("feed");
    let mut fetcher = Fetcher {
        fra: &mut h.fra,
        fsa: &mut h.fsa,
        rlist: &mut h.rlist,
        sinks: &mut h.sinks,
        worker_id: 0,
        staging_dir: staging,
        cancel: &rx,
    };
    fetcher.drain(src).expect("drain")
}

#[test]
fn remove_mode_fetches_deletes_and_resets() {
    let mut h = harness(
        "remove",
        |d| {
            d.set_filters("*.txt");
            d.policy = ReacquirePolicy::Remove.as_u8();
            d.remove = 1;
        },
        |_| {},
    );
    let mut src = MockSource::new(vec![
        MockFile::new("a.txt", 1_700_000_000, &vec![b'a'; 100]),
        MockFile::new("b.txt", 1_700_000_000, &vec![b'b'; 200]),
    ]);
    let out = run_cycle(&mut h, &mut src);
    assert_eq!(out.files_fetched, 2);
    assert_eq!(out.bytes_fetched, 300);

    // both renamed into place without the dot prefix
    let staging = h.area.workdir.join("files").join("feed");
    assert_eq!(std::fs::read(staging.join("a.txt")).unwrap().len(), 100);
    assert_eq!(std::fs::read(staging.join("b.txt")).unwrap().len(), 200);
    assert!(!staging.join(".a.txt").exists());

    // the remote side was cleaned up
    let mut deleted = src.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["a.txt".to_string(), "b.txt".to_string()]);

    // host counters moved
    assert_eq!(h.fsa.job().no_of_files_done, 2);
    assert_eq!(h.fsa.job().bytes_send, 300);

    // the session loop resets the list at the end of a remove cycle
    let proc = h.rlist.lock_proc().expect("proc lock");
    h.rlist.reset(&proc).expect("reset");
    drop(proc);
    assert_eq!(h.rlist.count(), 0);
}

#[test]
fn default_mode_marks_entries_retrieved() {
    let mut h = harness("default", |d| d.set_filters("*.bin"), |_| {});
    // previous cycles left host and directory error state behind
    {
        let e = h.fsa.entry_mut();
        e.error_counter = 3;
        e.error_history[0] = 1;
        e.error_history[1] = 1;
    }
    {
        let e = h.fra.entry_mut();
        e.error_counter = 2;
        e.dir_flag |= getferry::table::fra::DIR_ERROR_SET;
    }
    let mut src = MockSource::new(vec![
        MockFile::new("./one.bin", 1_700_000_000, b"0123456789"),
        MockFile::new("two.bin", 1_700_000_000, b"abcdef"),
    ]);
    let out = run_cycle(&mut h, &mut src);
    assert_eq!(out.files_fetched, 2);

    // the first good file zeroes both error states
    assert_eq!(h.fsa.entry().error_counter, 0);
    assert_eq!(h.fsa.entry().error_history[0], 0);
    assert_eq!(h.fsa.entry().error_history[1], 0);
    assert_eq!(h.fra.entry().error_counter, 0);
    assert_eq!(h.fra.entry().dir_flag & getferry::table::fra::DIR_ERROR_SET, 0);
    let event_log =
        std::fs::read_to_string(h.area.workdir.join("log").join("event.log")).expect("event log");
    assert!(event_log.contains("ERROR_END host"), "got: {}", event_log);
    assert!(event_log.contains("ERROR_END directory"), "got: {}", event_log);
    for i in 0..h.rlist.count() {
        let e = h.rlist.entry(i).unwrap();
        assert_eq!(e.retrieved, 1, "{} retrieved", e.name());
        assert_eq!(e.assigned, 0, "{} released", e.name());
    }
    // nothing was deleted remotely in the default policy
    assert!(src.deleted.is_empty());
    let staging = h.area.workdir.join("files").join("feed");
    assert_eq!(std::fs::read(staging.join("one.bin")).unwrap(), b"0123456789");
    assert_eq!(std::fs::read(staging.join("two.bin")).unwrap(), b"abcdef");
}

#[test]
fn append_only_growth_fetches_just_the_tail() {
    let mut h = harness(
        "append",
        |d| {
            d.set_filters("*.log");
            d.policy = ReacquirePolicy::AppendOnly.as_u8();
        },
        |_| {},
    );
    let prefix = vec![b'A'; 1000];
    let mut src = MockSource::new(vec![MockFile::new("grow.log", 1_700_000_000, &prefix)]);
    let out = run_cycle(&mut h, &mut src);
    assert_eq!(out.bytes_fetched, 1000);

    // the remote file grows and its mtime moves
    let mut full = prefix.clone();
    full.extend(std::iter::repeat_n(b'B', 500));
    src.files[0].body = full.clone();
    src.files[0].mtime = 1_700_000_500;

    let out = run_cycle(&mut h, &mut src);
    // only the grown tail travelled
    assert_eq!(out.bytes_fetched, 500);
    assert_eq!(src.retrieves.last(), Some(&("grow.log".to_string(), 1000)));

    let staging = h.area.workdir.join("files").join("feed");
    let local = std::fs::read(staging.join("grow.log")).unwrap();
    assert_eq!(local.len(), 1500);
    assert_eq!(&local[..1000], &prefix[..], "prefix untouched");
    assert!(local[1000..].iter().all(|&b| b == b'B'));

    let idx = h.rlist.find("grow.log").unwrap().unwrap();
    let e = h.rlist.entry(idx).unwrap();
    assert_eq!(e.retrieved, 1);
    assert_eq!(e.size, 1500);
    assert_eq!(e.prev_size, 0);
}

/// A source whose body reader stalls long enough to blow the per-file
/// transfer budget.
struct StallingSource {
    inner: MockSource,
}

struct StallingReader;

impl std::io::Read for StallingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(600));
        let n = buf.len().min(16);
        buf[..n].fill(b'x');
        Ok(n)
    }
}

impl RemoteSource for StallingSource {
    fn list(&mut self) -> anyhow::Result<Vec<String>> {
        self.inner.list()
    }
    fn mtime(&mut self, name: &str) -> anyhow::Result<getferry::remote::Probe<i64>> {
        self.inner.mtime(name)
    }
    fn size(&mut self, name: &str) -> anyhow::Result<getferry::remote::Probe<i64>> {
        self.inner.size(name)
    }
    fn retrieve(&mut self, _: &str, _: i64) -> anyhow::Result<Box<dyn std::io::Read + Send>> {
        Ok(Box::new(StallingReader))
    }
    fn retrieve_done(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn delete(&mut self, name: &str) -> anyhow::Result<()> {
        self.inner.delete(name)
    }
    fn noop(&mut self) -> anyhow::Result<()> {
        self.inner.noop()
    }
    fn quit(&mut self) -> anyhow::Result<()> {
        self.inner.quit()
    }
    fn probe_date_supported(&self) -> bool {
        self.inner.probe_date_supported()
    }
    fn probe_size_supported(&self) -> bool {
        self.inner.probe_size_supported()
    }
}

#[test]
fn transfer_timeout_aborts_and_keeps_the_assignment() {
    let mut h = harness("timeout", |_| {}, |e| e.transfer_timeout = 1);
    let mut src = StallingSource {
        inner: MockSource::new(vec![MockFile::new("slow.bin", 1_700_000_000, &vec![0u8; 4096])]),
    };
    {
        let mut scanner = Scanner {
            fra: &mut h.fra,
            fsa: &mut h.fsa,
            rlist: &mut h.rlist,
            sinks: &mut h.sinks,
            worker_id: 0,
            distributed_helper: false,
        };
        scanner.scan(&mut src).expect("scan");
    }
    let (_tx, rx) = unbounded();
    let staging = h.area.workdir.join("files").join("feed");
    let err = {
        let mut fetcher = Fetcher {
            fra: &mut h.fra,
            fsa: &mut h.fsa,
            rlist: &mut h.rlist,
            sinks: &mut h.sinks,
            worker_id: 0,
            staging_dir: staging.clone(),
            cancel: &rx,
        };
        fetcher.drain(&mut src).unwrap_err()
    };
    let fe = FetchError::from_anyhow(&err).expect("fetch error");
    assert!(matches!(fe, FetchError::StillFilesToSend(_)), "got {:?}", fe);
    // the file stays ours for the next cycle and no staging residue is left
    let idx = h.rlist.find("slow.bin").unwrap().unwrap();
    assert_eq!(h.rlist.entry(idx).unwrap().assigned, 1);
    assert!(!staging.join(".slow.bin").exists());
    assert!(!staging.join("slow.bin").exists());
}
