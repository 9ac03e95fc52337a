//! Shared status area behavior across independent attachments.

use filerelay::progress::ProgressReporter;
use filerelay::status::fsa::{ConnectStatus, FsaArea, Region};

#[test]
fn counters_written_by_one_attachment_are_seen_by_another() {
    let dir = tempfile::tempdir().unwrap();
    let writer = FsaArea::create(dir.path(), 1, 2).unwrap();
    {
        let h = writer.host_mut(1);
        h.set_alias("beta");
        h.total_file_counter = 4;
        h.total_file_size = 4096;
        h.slots[0].connect_status = ConnectStatus::Active as u8;
    }
    let reader = FsaArea::attach(dir.path()).unwrap();
    assert_eq!(reader.find_host("beta"), Some(1));
    let h = reader.host(1);
    assert_eq!(h.total_file_counter, 4);
    assert_eq!(h.total_file_size, 4096);
    assert_eq!(ConnectStatus::from_u8(h.slots[0].connect_status), ConnectStatus::Active);
}

#[test]
fn file_accounting_balances_against_host_totals() {
    let dir = tempfile::tempdir().unwrap();
    let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
    {
        let h = fsa.host_mut(0);
        h.set_alias("gamma");
        h.total_file_counter = 2;
        h.total_file_size = 300;
    }
    let mut rep = ProgressReporter::new(&fsa, 0, 0);
    rep.begin_file("one.dat", 100);
    rep.add_bytes(100).unwrap();
    rep.finish_file(100).unwrap();
    rep.begin_file("two.dat", 200);
    rep.add_bytes(120).unwrap();
    rep.fail_file().unwrap();

    let h = fsa.host(0);
    // Finished work left the outstanding totals; failed work did not.
    assert_eq!(h.total_file_counter, 1);
    assert_eq!(h.total_file_size, 200);
    assert_eq!(h.slots[0].no_of_files_done, 1);
    assert_eq!(h.slots[0].bytes_send, 100);
    assert_eq!(h.slots[0].file_name_in_use(), "");
}

#[test]
fn stale_mapping_is_detected_after_recreation() {
    let dir = tempfile::tempdir().unwrap();
    let old = FsaArea::create(dir.path(), 1, 1).unwrap();
    assert!(old.check_stale().is_ok());
    // Dispatcher rebuilds the area with a new generation id.
    let _new = FsaArea::create(dir.path(), 2, 1).unwrap();
    assert!(old.check_stale().is_err());
}

#[test]
fn region_locks_are_reentrant_per_region() {
    let dir = tempfile::tempdir().unwrap();
    let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
    let tfc = fsa.lock(0, Region::Tfc).unwrap();
    let _ec = fsa.lock(0, Region::Ec).unwrap();
    let _hs = fsa.lock(0, Region::Hs).unwrap();
    drop(tfc);
    let _tfc = fsa.lock(0, Region::Tfc).unwrap();
}
