//! Periodic fleet summaries: hourly through yearly differencing of the
//! monotonically growing peer counters, with overflow-safe diffs.

use chrono::{Datelike, Timelike};

use crate::status::msa::{
    CURRENT_SUM, DAY_SUM, HOUR_SUM, MONTH_SUM, MsaArea, PeerCounters, WEEK_SUM, YEAR_SUM,
};

/// Counter names in `PeerCounters::as_array` order, for log lines.
pub const COUNTER_NAMES: [&str; PeerCounters::FIELDS] = [
    "files_received",
    "bytes_received",
    "files_send",
    "bytes_send",
    "connections",
    "total_errors",
    "log_bytes_received",
];

/// Difference of a monotonic counter against its saved slot. A saved value
/// above current means the peer restarted and the counter wrapped; that
/// diff is 0, with a debug line.
pub fn diff_counter(current: u64, saved: u64, peer: &str, name: &str) -> u64 {
    if current >= saved {
        current - saved
    } else {
        tracing::debug!(
            "{}: {} went backwards ({} < {}), counting 0",
            peer,
            name,
            current,
            saved
        );
        0
    }
}

/// Byte magnitudes for summary lines.
pub fn scale_bytes(bytes: u64) -> String {
    const STEPS: [(u64, &str); 6] = [
        (1 << 60, "EB"),
        (1 << 50, "PB"),
        (1 << 40, "TB"),
        (1 << 30, "GB"),
        (1 << 20, "MB"),
        (1 << 10, "KB"),
    ];
    for (unit, label) in STEPS {
        if bytes >= unit {
            return format!("{:.2} {}", bytes as f64 / unit as f64, label);
        }
    }
    format!("{} B", bytes)
}

/// Week-of-year from a 0-based day-of-year and day-of-week (Sunday = 0).
pub fn week_number(yday: i64, wday: i64) -> i64 {
    (yday - (wday - 1 + 7) % 7 + 7) / 7
}

/// Calendar coordinates a period rollover is detected against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodStamp {
    pub hour: u32,
    pub day: u32,
    pub week: i64,
    pub month: u32,
    pub year: i32,
}

impl PeriodStamp {
    pub fn from_local(t: chrono::DateTime<chrono::Local>) -> Self {
        let yday = t.ordinal0() as i64;
        let wday = t.weekday().num_days_from_sunday() as i64;
        Self {
            hour: t.hour(),
            day: t.day(),
            week: week_number(yday, wday),
            month: t.month(),
            year: t.year(),
        }
    }

    /// Period slots due between `self` and `now`, oldest granularity first.
    pub fn due_slots(&self, now: &PeriodStamp) -> Vec<usize> {
        let mut due = Vec::new();
        if now.hour != self.hour {
            due.push(HOUR_SUM);
        }
        if now.day != self.day {
            due.push(DAY_SUM);
        }
        if now.week != self.week {
            due.push(WEEK_SUM);
        }
        if now.month != self.month {
            due.push(MONTH_SUM);
        }
        if now.year != self.year {
            due.push(YEAR_SUM);
        }
        due
    }
}

fn slot_name(slot: usize) -> &'static str {
    match slot {
        HOUR_SUM => "hour",
        DAY_SUM => "day",
        WEEK_SUM => "week",
        MONTH_SUM => "month",
        YEAR_SUM => "year",
        _ => "?",
    }
}

/// One period report: per-peer diffs plus the fleet total.
#[derive(Debug, Clone)]
pub struct PeriodReport {
    pub slot: usize,
    pub per_peer: Vec<(String, [u64; PeerCounters::FIELDS])>,
    pub fleet: [u64; PeerCounters::FIELDS],
}

/// Diff every peer's CURRENT_SUM against the period slot, emit the log
/// lines, then roll CURRENT_SUM into the slot.
pub fn summarize_period(msa: &MsaArea, slot: usize) -> PeriodReport {
    let mut report = PeriodReport { slot, per_peer: Vec::new(), fleet: [0; PeerCounters::FIELDS] };
    for pos in 0..msa.peer_count() {
        let peer = msa.peer_mut(pos);
        let alias = peer.alias().to_string();
        let current = peer.counters[CURRENT_SUM].as_array();
        let saved = peer.counters[slot].as_array();
        let mut diffs = [0u64; PeerCounters::FIELDS];
        for i in 0..PeerCounters::FIELDS {
            diffs[i] = diff_counter(current[i], saved[i], &alias, COUNTER_NAMES[i]);
            report.fleet[i] += diffs[i];
        }
        tracing::info!(
            "[{}] {}: received {} files {} , send {} files {} , {} connections, {} errors",
            slot_name(slot),
            alias,
            diffs[0],
            scale_bytes(diffs[1]),
            diffs[2],
            scale_bytes(diffs[3]),
            diffs[4],
            diffs[5]
        );
        report.per_peer.push((alias, diffs));
        peer.counters[slot] = peer.counters[CURRENT_SUM];
    }
    tracing::info!(
        "[{}] fleet total: received {} files {} , send {} files {} , {} connections, {} errors",
        slot_name(slot),
        report.fleet[0],
        scale_bytes(report.fleet[1]),
        report.fleet[2],
        scale_bytes(report.fleet[3]),
        report.fleet[4],
        report.fleet[5]
    );
    report
}

/// Aggregate CURRENT_SUM per configured group. Peers without a group are
/// left out.
pub fn group_totals(
    msa: &MsaArea,
) -> std::collections::HashMap<String, [u64; PeerCounters::FIELDS]> {
    let mut map: std::collections::HashMap<String, [u64; PeerCounters::FIELDS]> =
        std::collections::HashMap::new();
    for pos in 0..msa.peer_count() {
        let peer = msa.peer(pos);
        let group = peer.group();
        if group.is_empty() {
            continue;
        }
        let entry = map.entry(group.to_string()).or_default();
        let current = peer.counters[CURRENT_SUM].as_array();
        for i in 0..PeerCounters::FIELDS {
            entry[i] += current[i];
        }
    }
    map
}
