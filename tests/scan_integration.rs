mod common;

use chrono::Local;
use common::{MockFile, MockSource, harness, rlist_snapshot};
use getferry::rlist::{AttachMode, RL_GOT_SIZE_DATE, RlistHandle};
use getferry::scan::Scanner;
use getferry::table::fra::{
    ALL_DISABLED, MAX_COPIED, ONE_PROCESS_JUST_SCANNING, ReacquirePolicy, UNKNOWN_FILES,
};

fn scanner<'a>(h: &'a mut common::Harness) -> Scanner<'a> {
    Scanner {
        fra: &mut h.fra,
        fsa: &mut h.fsa,
        rlist: &mut h.rlist,
        sinks: &mut h.sinks,
        worker_id: 0,
        distributed_helper: false,
    }
}

#[test]
fn dot_slash_is_stripped_and_both_names_assigned() {
    let mut h = harness("strip", |d| d.set_filters("*.bin"), |_| {});
    let mut src = MockSource::new(vec![
        MockFile::new("./a.bin", 1_700_000_000, b"aaaa"),
        MockFile::new("b.bin", 1_700_000_000, b"bbbbbb"),
    ]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 2);
    assert_eq!(out.bytes_to_retrieve, 10);
    assert!(!out.more_files_in_list);
    assert_eq!(h.rlist.count(), 2);
    let names: Vec<String> =
        (0..2).map(|i| h.rlist.entry(i).unwrap().name().to_string()).collect();
    assert!(names.contains(&"a.bin".to_string()));
    assert!(names.contains(&"b.bin".to_string()));
    for i in 0..2 {
        assert_eq!(h.rlist.entry(i).unwrap().assigned, 1, "worker 0 stores id+1");
    }
    // scan totals are published to the host table for observers
    assert_eq!(h.fsa.job().no_of_files, 2);
    assert_eq!(h.fsa.job().file_size, 10);
    assert_eq!(h.fsa.entry().total_file_counter, 2);
}

#[test]
fn unsupported_probes_downgrade_to_unknown_metadata() {
    let mut h = harness("probes", |_| {}, |_| {});
    let mut src = MockSource::new(vec![
        MockFile::new("a.txt", 1_700_000_000, b"xxxx"),
        MockFile::new("b.txt", 1_700_000_000, b"yyyy"),
    ]);
    src.size_supported = false;
    src.date_supported = false;
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 2);
    // unknown sizes add nothing to the byte total
    assert_eq!(out.bytes_to_retrieve, 0);
    for i in 0..2 {
        let e = h.rlist.entry(i).unwrap();
        assert_eq!(e.size, -1);
        assert_eq!(e.got_date, 0);
        assert_eq!(e.special_flag & RL_GOT_SIZE_DATE, 0);
    }
}

#[test]
fn stale_dot_lock_is_deleted_on_reject() {
    let now = Local::now().timestamp();
    let mut h = harness(
        "rlock",
        |d| {
            d.set_filters("*.dat");
            d.accept_dot_files = 1;
            d.locked_file_time = 1800;
        },
        |_| {},
    );
    let mut src = MockSource::new(vec![
        MockFile::new(".lock.tmp", now - 3600, b""),
        MockFile::new("fresh.dat", now - 10, b"data"),
    ]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(src.deleted, vec![".lock.tmp".to_string()]);
    assert_eq!(out.files_to_retrieve, 1);
    let delete_log = std::fs::read_to_string(h.area.workdir.join("log").join("delete.log"))
        .expect("delete log");
    // old-rlocked carries its stable reason code
    assert!(delete_log.contains(".lock.tmp|27|"), "got: {}", delete_log);
}

#[test]
fn old_unknown_files_are_deleted_when_opted_in() {
    let now = Local::now().timestamp();
    let mut h = harness(
        "unknown",
        |d| {
            d.set_filters("*.dat");
            d.delete_files_flag = UNKNOWN_FILES;
            d.unknown_file_time = 600;
        },
        |_| {},
    );
    let mut src = MockSource::new(vec![
        MockFile::new("junk.old", now - 7200, b"zz"),
        MockFile::new("young.old", now - 30, b"zz"),
    ]);
    let _ = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(src.deleted, vec!["junk.old".to_string()]);
    let delete_log = std::fs::read_to_string(h.area.workdir.join("log").join("delete.log"))
        .expect("delete log");
    assert!(delete_log.contains("junk.old|7|"), "got: {}", delete_log);
}

#[test]
fn name_length_boundary() {
    let mut h = harness("longname", |_| {}, |_| {});
    let ok_name = "a".repeat(255);
    let too_long = "b".repeat(256);
    let mut src = MockSource::new(vec![
        MockFile::new(&ok_name, 1_700_000_000, b"1"),
        MockFile::new(&too_long, 1_700_000_000, b"2"),
    ]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 1);
    assert_eq!(h.rlist.count(), 1);
    assert_eq!(h.rlist.entry(0).unwrap().name(), ok_name);
    let transfer_log = std::fs::read_to_string(h.area.workdir.join("log").join("transfer.log"))
        .expect("transfer log");
    assert!(transfer_log.contains("exceeds 255 bytes"), "got: {}", transfer_log);
}

#[test]
fn ignore_size_equal_skips_the_file() {
    let mut h = harness(
        "ignsize",
        |d| {
            d.ignore_size = 100;
            d.ignore_size_op = getferry::table::fra::Compare::Equal.as_u8();
        },
        |_| {},
    );
    let mut src = MockSource::new(vec![
        MockFile::new("exact.bin", 1_700_000_000, &vec![0u8; 100]),
        MockFile::new("other.bin", 1_700_000_000, &vec![0u8; 99]),
    ]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 1);
    let idx = h.rlist.find("exact.bin").unwrap().expect("recorded");
    assert_eq!(h.rlist.entry(idx).unwrap().assigned, 0);
}

#[test]
fn rescan_of_unchanged_listing_is_idempotent() {
    let mut h = harness("idem", |_| {}, |_| {});
    let files = vec![
        MockFile::new("one.txt", 1_700_000_000, b"11"),
        MockFile::new("two.txt", 1_700_000_100, b"222"),
        MockFile::new("three.txt", 1_700_000_200, b"3333"),
    ];
    let mut src = MockSource::new(files);
    let first = scanner(&mut h).scan(&mut src).expect("first scan");
    assert_eq!(first.files_to_retrieve, 3);
    let before = rlist_snapshot(&mut h.rlist);
    let second = scanner(&mut h).scan(&mut src).expect("second scan");
    // everything already assigned: nothing new to retrieve, list unchanged
    assert_eq!(second.files_to_retrieve, 0);
    assert_eq!(rlist_snapshot(&mut h.rlist), before);
}

#[test]
fn copy_caps_leave_overflow_in_the_list() {
    let mut h = harness("caps", |d| d.max_copied_files = 3, |_| {});
    let mut src = MockSource::new(vec![
        MockFile::new("f1", 1_700_000_000, b"a"),
        MockFile::new("f2", 1_700_000_000, b"b"),
        MockFile::new("f3", 1_700_000_000, b"c"),
        MockFile::new("f4", 1_700_000_000, b"d"),
    ]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 2);
    assert!(out.more_files_in_list);
    assert!(h.fra.entry().dir_flag & MAX_COPIED != 0);
}

#[test]
fn scanning_only_worker_assigns_nothing() {
    let mut h = harness("justscan", |d| d.dir_flag |= ONE_PROCESS_JUST_SCANNING, |_| {});
    let mut src = MockSource::new(vec![MockFile::new("f1", 1_700_000_000, b"a")]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 0);
    assert!(out.more_files_in_list);
    assert_eq!(h.rlist.entry(0).unwrap().assigned, 0);
}

#[test]
fn disabled_directory_with_remove_deletes_instead_of_fetching() {
    let mut h = harness(
        "disabled",
        |d| {
            d.dir_flag |= ALL_DISABLED;
            d.remove = 1;
        },
        |_| {},
    );
    let mut src = MockSource::new(vec![MockFile::new("f1", 1_700_000_000, b"a")]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 0);
    assert_eq!(src.deleted, vec!["f1".to_string()]);
    let delete_log = std::fs::read_to_string(h.area.workdir.join("log").join("delete.log"))
        .expect("delete log");
    assert!(delete_log.contains("f1|17|"), "host-disabled reason, got: {}", delete_log);
}

#[test]
fn get_once_policies_respect_retrieved_state() {
    // inexact: retrieved is final even when metadata drifts
    let mut h = harness(
        "once_inexact",
        |d| d.policy = ReacquirePolicy::GetOnceInexact.as_u8(),
        |_| {},
    );
    let mut src = MockSource::new(vec![MockFile::new("f1", 1_700_000_000, b"abc")]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 1);
    {
        let idx = h.rlist.find("f1").unwrap().unwrap();
        let e = h.rlist.entry_mut(idx).unwrap();
        e.retrieved = 1;
        e.assigned = 0;
    }
    src.files[0].body = b"abcdef".to_vec();
    let out = scanner(&mut h).scan(&mut src).expect("rescan");
    assert_eq!(out.files_to_retrieve, 0);

    // exact without complete metadata re-probes and sees the change
    let mut h2 = harness(
        "once_exact",
        |d| d.policy = ReacquirePolicy::GetOnceExact.as_u8(),
        |_| {},
    );
    let mut src2 = MockSource::new(vec![MockFile::new("f1", 1_700_000_000, b"abc")]);
    let _ = scanner(&mut h2).scan(&mut src2).expect("scan");
    {
        let idx = h2.rlist.find("f1").unwrap().unwrap();
        let e = h2.rlist.entry_mut(idx).unwrap();
        e.retrieved = 1;
        e.assigned = 0;
        // metadata was never complete for this one
        e.special_flag = 0;
    }
    src2.files[0].body = b"abcdef".to_vec();
    let out2 = scanner(&mut h2).scan(&mut src2).expect("rescan");
    assert_eq!(out2.files_to_retrieve, 1, "size change re-arms an exact entry");
}

#[test]
fn empty_listing_is_a_valid_scan() {
    let mut h = harness("empty", |_| {}, |_| {});
    let mut src = MockSource::new(vec![]);
    let out = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(out.files_to_retrieve, 0);
    assert_eq!(out.bytes_to_retrieve, 0);
    assert!(!out.more_files_in_list);
    assert_eq!(h.rlist.count(), 0);
}

#[test]
fn vanished_entries_are_compacted_after_the_pass() {
    let mut h = harness("vanish", |_| {}, |_| {});
    h.rlist.insert("gone.txt", 5, 1_600_000_000, 0).expect("seed");
    {
        let e = h.rlist.entry_mut(0).unwrap();
        e.retrieved = 1;
    }
    let mut src = MockSource::new(vec![MockFile::new("still.txt", 1_700_000_000, b"s")]);
    let _ = scanner(&mut h).scan(&mut src).expect("scan");
    assert_eq!(h.rlist.count(), 1);
    assert_eq!(h.rlist.entry(0).unwrap().name(), "still.txt");
    // a second handle sees the compacted list too
    let mut other = RlistHandle::attach(&h.area.workdir.join("rl").join("1"), AttachMode::Required)
        .expect("attach");
    assert_eq!(other.count(), 1);
    assert_eq!(other.entry(0).unwrap().name(), "still.txt");
}
