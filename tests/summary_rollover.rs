//! Fleet summary differencing against the peer status area.

use filerelay::monitor::summary::{summarize_period, PeriodStamp};
use filerelay::status::msa::{CURRENT_SUM, DAY_SUM, HOUR_SUM, MsaArea};

#[test]
fn hourly_rollover_diffs_and_saves() {
    let dir = tempfile::tempdir().unwrap();
    let msa = MsaArea::create(dir.path(), 1, 2).unwrap();
    {
        let p = msa.peer_mut(0);
        p.set_alias("site-a");
        p.counters[CURRENT_SUM].files_send = 120;
        p.counters[CURRENT_SUM].bytes_send = 1 << 21;
        p.counters[HOUR_SUM].files_send = 100;
        p.counters[HOUR_SUM].bytes_send = 1 << 20;
    }
    {
        let p = msa.peer_mut(1);
        p.set_alias("site-b");
        // Peer restarted since the last hour mark; counters wrapped.
        p.counters[CURRENT_SUM].connections = 3;
        p.counters[HOUR_SUM].connections = 10;
    }

    let report = summarize_period(&msa, HOUR_SUM);
    assert_eq!(report.per_peer[0].1[2], 20);
    assert_eq!(report.per_peer[0].1[3], 1 << 20);
    // Overflowed counter reports 0, never a negative wrap.
    assert_eq!(report.per_peer[1].1[4], 0);
    assert_eq!(report.fleet[2], 20);

    // The period slot now carries CURRENT_SUM for the next interval.
    assert_eq!(msa.peer(0).counters[HOUR_SUM].files_send, 120);
    assert_eq!(msa.peer(1).counters[HOUR_SUM].connections, 3);

    // The next rollover with no traffic reports all zeroes.
    let quiet = summarize_period(&msa, HOUR_SUM);
    assert!(quiet.fleet.iter().all(|&v| v == 0));
}

#[test]
fn day_slot_is_independent_of_hour_slot() {
    let dir = tempfile::tempdir().unwrap();
    let msa = MsaArea::create(dir.path(), 1, 1).unwrap();
    {
        let p = msa.peer_mut(0);
        p.set_alias("solo");
        p.counters[CURRENT_SUM].files_received = 50;
        p.counters[HOUR_SUM].files_received = 45;
        p.counters[DAY_SUM].files_received = 10;
    }
    let hour = summarize_period(&msa, HOUR_SUM);
    let day = summarize_period(&msa, DAY_SUM);
    assert_eq!(hour.per_peer[0].1[0], 5);
    assert_eq!(day.per_peer[0].1[0], 40);
}

#[test]
fn period_stamps_drive_which_slots_roll() {
    use chrono::TimeZone;
    let before = PeriodStamp::from_local(
        chrono::Local.with_ymd_and_hms(2026, 7, 31, 10, 59, 0).unwrap(),
    );
    let after = PeriodStamp::from_local(
        chrono::Local.with_ymd_and_hms(2026, 7, 31, 11, 1, 0).unwrap(),
    );
    assert_eq!(before.due_slots(&after), vec![HOUR_SUM]);
}
