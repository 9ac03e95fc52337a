//! Progress reporting into the shared host status area.
//!
//! The worker owns one job slot and writes it freely; host-level totals are
//! only touched under the TFC/EC/HS region locks and only for a handful of
//! field updates, never across I/O. A per-file snapshot allows counter
//! reconstruction when a transfer dies halfway.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::StatusAreaError;
use crate::fifo;
use crate::status::fsa::{
    AUTO_PAUSE_QUEUE, ConnectStatus, ERROR_QUEUE_SET, FsaArea, HOST_ACTION_SUCCESS,
    HOST_ERROR_OFFLINE, Region,
};

/// How long slot-local counters may run ahead before the reporter re-checks
/// the mapping against the dispatcher's id file.
pub const LOCK_INTERVAL_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct FileSnapshot {
    listed_size: u64,
    bytes_send: u64,
    file_size_done: u64,
    no_of_files_done: i32,
}

pub struct ProgressReporter<'a> {
    fsa: &'a FsaArea,
    host_pos: usize,
    slot_no: usize,
    last_check: Instant,
    snapshot: Option<FileSnapshot>,
    silent_size_drift: bool,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(fsa: &'a FsaArea, host_pos: usize, slot_no: usize) -> Self {
        Self {
            fsa,
            host_pos,
            slot_no,
            last_check: Instant::now(),
            snapshot: None,
            silent_size_drift: false,
        }
    }

    /// Unlocked-source jobs may opt out of the size-drift warning.
    pub fn set_silent_size_drift(&mut self, silent: bool) {
        self.silent_size_drift = silent;
    }

    pub fn set_connect_status(&self, status: ConnectStatus) {
        self.fsa.host_mut(self.host_pos).slots[self.slot_no].connect_status = status as u8;
    }

    /// Announce the job size so UIs can render totals before the first file.
    pub fn set_job(&self, job_id: u32, files: i32, bytes: u64) {
        let slot = &mut self.fsa.host_mut(self.host_pos).slots[self.slot_no];
        slot.job_id = job_id;
        slot.no_of_files = files;
        slot.file_size = bytes;
        slot.no_of_files_done = 0;
        slot.file_size_done = 0;
    }

    /// Begin one file: record its name/size in the slot and snapshot the
    /// counters a failure would have to restore.
    pub fn begin_file(&mut self, name: &str, listed_size: u64) {
        let slot = &mut self.fsa.host_mut(self.host_pos).slots[self.slot_no];
        slot.set_file_name_in_use(name);
        slot.file_size_in_use = listed_size;
        slot.file_size_in_use_done = 0;
        self.snapshot = Some(FileSnapshot {
            listed_size,
            bytes_send: slot.bytes_send,
            file_size_done: slot.file_size_done,
            no_of_files_done: slot.no_of_files_done,
        });
    }

    /// Account streamed bytes. Slot fields are worker-owned, so no lock;
    /// the periodic check catches a recreated area.
    pub fn add_bytes(&mut self, n: u64) -> Result<(), StatusAreaError> {
        let slot = &mut self.fsa.host_mut(self.host_pos).slots[self.slot_no];
        slot.file_size_in_use_done += n;
        slot.bytes_send += n;
        if self.last_check.elapsed() >= LOCK_INTERVAL_TIME {
            self.last_check = Instant::now();
            self.fsa.check_stale()?;
        }
        Ok(())
    }

    /// Complete the current file: fold it into the slot's done counters and
    /// take it out of the host's outstanding totals under the TFC lock.
    /// A drift between list-time size and streamed bytes is logged and the
    /// totals corrected by the listed (charged) amount.
    pub fn finish_file(&mut self, streamed: u64) -> Result<(), StatusAreaError> {
        let snap = self.snapshot.take().unwrap_or(FileSnapshot {
            listed_size: streamed,
            bytes_send: 0,
            file_size_done: 0,
            no_of_files_done: 0,
        });
        let _tfc = self
            .fsa
            .lock(self.host_pos, Region::Tfc)
            .map_err(|e| StatusAreaError::Io(e.to_string()))?;
        let host = self.fsa.host_mut(self.host_pos);
        let slot = &mut host.slots[self.slot_no];
        slot.no_of_files_done += 1;
        slot.file_size_done += streamed;
        slot.file_size_in_use = 0;
        slot.file_size_in_use_done = 0;
        slot.clear_file_name_in_use();
        if streamed != snap.listed_size && !self.silent_size_drift {
            tracing::warn!(
                "slot {} file changed size during transfer: listed {} streamed {}",
                self.slot_no,
                snap.listed_size,
                streamed
            );
        }
        if host.sub_totals_checked(1, snap.listed_size) {
            tracing::warn!("host totals clamped while finishing a file");
        }
        Ok(())
    }

    /// Account a file that was discarded instead of delivered (age limit,
    /// duplicate writer): the outstanding totals shrink but nothing counts
    /// as done.
    pub fn discard_file(&mut self, listed_size: u64) -> Result<(), StatusAreaError> {
        self.snapshot = None;
        let _tfc = self
            .fsa
            .lock(self.host_pos, Region::Tfc)
            .map_err(|e| StatusAreaError::Io(e.to_string()))?;
        let host = self.fsa.host_mut(self.host_pos);
        let slot = &mut host.slots[self.slot_no];
        slot.file_size_in_use = 0;
        slot.file_size_in_use_done = 0;
        slot.clear_file_name_in_use();
        if host.sub_totals_checked(1, listed_size) {
            tracing::warn!("host totals clamped while discarding a file");
        }
        Ok(())
    }

    /// Undo the current file's contribution after a mid-stream failure so a
    /// later retry starts from consistent counters.
    pub fn fail_file(&mut self) -> Result<(), StatusAreaError> {
        if let Some(snap) = self.snapshot.take() {
            let _tfc = self
                .fsa
                .lock(self.host_pos, Region::Tfc)
                .map_err(|e| StatusAreaError::Io(e.to_string()))?;
            let slot = &mut self.fsa.host_mut(self.host_pos).slots[self.slot_no];
            slot.bytes_send = snap.bytes_send;
            slot.file_size_done = snap.file_size_done;
            slot.no_of_files_done = snap.no_of_files_done;
            slot.file_size_in_use = 0;
            slot.file_size_in_use_done = 0;
            slot.clear_file_name_in_use();
        }
        Ok(())
    }

    /// Record a failed job on the host: bump the error counter and history.
    pub fn record_error(&self, status_code: u8) -> Result<(), StatusAreaError> {
        let _ec = self
            .fsa
            .lock(self.host_pos, Region::Ec)
            .map_err(|e| StatusAreaError::Io(e.to_string()))?;
        let host = self.fsa.host_mut(self.host_pos);
        host.error_counter += 1;
        host.push_error_history(status_code);
        Ok(())
    }

    /// After a successful transfer, flip the host out of its error state.
    /// Exactly one wake byte goes to the dispatcher, queued peer slots are
    /// released, and the queue-start event is logged. Returns true when the
    /// host actually was in an error state.
    pub fn clear_error_state(&self, work_dir: &Path) -> Result<bool, StatusAreaError> {
        let had_error;
        {
            let _ec = self
                .fsa
                .lock(self.host_pos, Region::Ec)
                .map_err(|e| StatusAreaError::Io(e.to_string()))?;
            let host = self.fsa.host_mut(self.host_pos);
            had_error = host.error_counter > 0;
            if had_error {
                host.error_counter = 0;
                host.push_error_history(0);
            }
        }
        if !had_error {
            return Ok(false);
        }
        {
            let _hs = self
                .fsa
                .lock(self.host_pos, Region::Hs)
                .map_err(|e| StatusAreaError::Io(e.to_string()))?;
            let host = self.fsa.host_mut(self.host_pos);
            host.host_status &= !(AUTO_PAUSE_QUEUE | ERROR_QUEUE_SET | HOST_ERROR_OFFLINE);
            host.host_status |= HOST_ACTION_SUCCESS;
        }
        // Peers parked in NOT_WORKING may reconnect now.
        let host = self.fsa.host_mut(self.host_pos);
        for (i, slot) in host.slots.iter_mut().enumerate() {
            if i != self.slot_no
                && ConnectStatus::from_u8(slot.connect_status) == ConnectStatus::NotWorking
            {
                slot.connect_status = ConnectStatus::Disconnect as u8;
            }
        }
        fifo::wake_dispatcher(work_dir);
        tracing::info!(host = %host.alias(), "error state cleared, queue started");
        Ok(true)
    }

    /// Exit-path reconciliation: zero the slot and, when the undelivered
    /// work is being dropped rather than requeued, take it out of the host
    /// totals.
    pub fn reset_slot_on_exit(
        &self,
        remaining_files: i32,
        remaining_bytes: u64,
        drop_from_totals: bool,
    ) -> Result<(), StatusAreaError> {
        let _tfc = self
            .fsa
            .lock(self.host_pos, Region::Tfc)
            .map_err(|e| StatusAreaError::Io(e.to_string()))?;
        let host = self.fsa.host_mut(self.host_pos);
        if drop_from_totals && host.sub_totals_checked(remaining_files, remaining_bytes) {
            tracing::warn!("host totals clamped during exit reconciliation");
        }
        host.slots[self.slot_no].reset();
        Ok(())
    }

    pub fn slot_no(&self) -> usize {
        self.slot_no
    }

    pub fn host_pos(&self) -> usize {
        self.host_pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::fsa::FsaArea;

    fn fixture() -> (tempfile::TempDir, FsaArea) {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
        let h = fsa.host_mut(0);
        h.set_alias("h0");
        h.total_file_counter = 3;
        h.total_file_size = 600;
        (dir, fsa)
    }

    #[test]
    fn finish_file_moves_outstanding_to_done() {
        let (_d, fsa) = fixture();
        let mut rep = ProgressReporter::new(&fsa, 0, 0);
        rep.begin_file("a.dat", 200);
        rep.add_bytes(200).unwrap();
        rep.finish_file(200).unwrap();
        let host = fsa.host(0);
        assert_eq!(host.total_file_counter, 2);
        assert_eq!(host.total_file_size, 400);
        let slot = &host.slots[0];
        assert_eq!(slot.no_of_files_done, 1);
        assert_eq!(slot.file_size_done, 200);
        assert_eq!(slot.file_name_in_use(), "");
    }

    #[test]
    fn fail_file_restores_snapshot() {
        let (_d, fsa) = fixture();
        let mut rep = ProgressReporter::new(&fsa, 0, 0);
        rep.begin_file("a.dat", 200);
        rep.add_bytes(150).unwrap();
        rep.fail_file().unwrap();
        let slot = &fsa.host(0).slots[0];
        assert_eq!(slot.bytes_send, 0);
        assert_eq!(slot.file_size_in_use, 0);
        assert_eq!(slot.no_of_files_done, 0);
        // Outstanding totals untouched; the file is still owed.
        assert_eq!(fsa.host(0).total_file_counter, 3);
    }

    #[test]
    fn clear_error_state_once() {
        let (dir, fsa) = fixture();
        fsa.host_mut(0).error_counter = 4;
        fsa.host_mut(0).host_status = AUTO_PAUSE_QUEUE | ERROR_QUEUE_SET;
        // A dispatcher is listening on the wake-up FIFO.
        let mut wake = crate::fifo::Fifo::open(&dir.path().join(crate::fifo::FD_WAKE_UP_FIFO))
            .unwrap();
        let rep = ProgressReporter::new(&fsa, 0, 0);
        assert!(rep.clear_error_state(dir.path()).unwrap());
        let host = fsa.host(0);
        assert_eq!(host.error_counter, 0);
        assert_eq!(host.host_status & (AUTO_PAUSE_QUEUE | ERROR_QUEUE_SET), 0);
        assert!(host.host_status & HOST_ACTION_SUCCESS != 0);
        // Exactly one wake byte reached the dispatcher.
        assert_eq!(wake.drain().unwrap().len(), 1);
        // Second call is a no-op, no further wake.
        assert!(!rep.clear_error_state(dir.path()).unwrap());
        assert!(wake.drain().unwrap().is_empty());
    }

    #[test]
    fn clear_error_state_releases_parked_peers() {
        let (dir, fsa) = fixture();
        fsa.host_mut(0).error_counter = 1;
        fsa.host_mut(0).slots[1].connect_status = ConnectStatus::NotWorking as u8;
        let rep = ProgressReporter::new(&fsa, 0, 0);
        rep.clear_error_state(dir.path()).unwrap();
        assert_eq!(
            ConnectStatus::from_u8(fsa.host(0).slots[1].connect_status),
            ConnectStatus::Disconnect
        );
    }

    #[test]
    fn exit_reset_drops_totals_when_requested() {
        let (_d, fsa) = fixture();
        let rep = ProgressReporter::new(&fsa, 0, 0);
        rep.reset_slot_on_exit(2, 400, true).unwrap();
        assert_eq!(fsa.host(0).total_file_counter, 1);
        assert_eq!(fsa.host(0).total_file_size, 200);
        rep.reset_slot_on_exit(5, 500, false).unwrap();
        assert_eq!(fsa.host(0).total_file_counter, 1);
    }

    #[test]
    fn record_error_bumps_history() {
        let (_d, fsa) = fixture();
        let rep = ProgressReporter::new(&fsa, 0, 0);
        rep.record_error(11).unwrap();
        assert_eq!(fsa.host(0).error_counter, 1);
        assert_eq!(fsa.host(0).error_history[0], 11);
    }
}
