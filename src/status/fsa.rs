//! Host status area: one record per transfer host, each carrying the live
//! job slots of the workers currently attached to it.

use std::path::{Path, PathBuf};

use crate::error::StatusAreaError;
use crate::status::lock::{RegionLock, lock_region};
use crate::status::{AREA_HEADER_LEN, MappedArea, read_cstr, write_cstr};

pub const MAX_ALIAS_LEN: usize = 40;
pub const MAX_HOSTNAME_LEN: usize = 64;
pub const MAX_FILENAME_LEN: usize = 192;
pub const MAX_UNIQUE_LEN: usize = 40;
pub const ERROR_HISTORY_LEN: usize = 5;
pub const MAX_JOB_SLOTS: usize = 10;

const FSA_MAGIC: u32 = 0x4652_5341; // "FRSA"

// host_status bits
pub const HOST_OFFLINE: u32 = 1 << 0;
pub const HOST_ERROR_OFFLINE: u32 = 1 << 1;
pub const AUTO_PAUSE_QUEUE: u32 = 1 << 2;
pub const ERROR_QUEUE_SET: u32 = 1 << 3;
pub const HOST_ACTION_SUCCESS: u32 = 1 << 4;
pub const STORE_IP: u32 = 1 << 5;

// protocol_options bits
pub const DISABLE_BURSTING: u32 = 1 << 0;
pub const TCP_KEEPALIVE: u32 = 1 << 1;
pub const STAT_KEEPALIVE: u32 = 1 << 2;
pub const FAST_CD: u32 = 1 << 3;
pub const FAST_MOVE: u32 = 1 << 4;
pub const SET_IDLE_TIME: u32 = 1 << 5;
pub const TIMEOUT_TRANSFER: u32 = 1 << 6;
pub const CHECK_SIZE: u32 = 1 << 7;
pub const IGNORE_BIN: u32 = 1 << 8;
pub const USE_CCC: u32 = 1 << 9;
pub const TLS_STRICT_VERIFY: u32 = 1 << 10;
pub const KEEP_TIME_STAMP: u32 = 1 << 11;
pub const KEEP_CONNECTED_DISCONNECT: u32 = 1 << 12;

/// `file_size_offset` sentinel: probe the size with a protocol command
/// instead of parsing a LIST column.
pub const FILE_SIZE_OFFSET_AUTO: i8 = -2;
pub const FILE_SIZE_OFFSET_NONE: i8 = -1;

/// Live state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    NotWorking = 0,
    Connecting = 1,
    Active = 2,
    RetrieveActive = 3,
    Closing = 4,
    Disconnect = 5,
    Disabled = 6,
}

impl ConnectStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectStatus::Connecting,
            2 => ConnectStatus::Active,
            3 => ConnectStatus::RetrieveActive,
            4 => ConnectStatus::Closing,
            5 => ConnectStatus::Disconnect,
            6 => ConnectStatus::Disabled,
            _ => ConnectStatus::NotWorking,
        }
    }
}

/// Per-worker row inside a host record. Only the owning worker writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JobSlot {
    pub connect_status: u8,
    pub no_of_files: i32,
    pub no_of_files_done: i32,
    pub file_size: u64,
    pub file_size_done: u64,
    pub file_size_in_use: u64,
    pub file_size_in_use_done: u64,
    pub bytes_send: u64,
    pub job_id: u32,
    pub file_name_in_use: [u8; MAX_FILENAME_LEN],
    pub unique_name: [u8; MAX_UNIQUE_LEN],
}

impl JobSlot {
    pub fn file_name_in_use(&self) -> &str {
        read_cstr(&self.file_name_in_use)
    }

    pub fn set_file_name_in_use(&mut self, name: &str) {
        write_cstr(&mut self.file_name_in_use, name);
    }

    pub fn clear_file_name_in_use(&mut self) {
        self.file_name_in_use.fill(0);
    }

    pub fn reset(&mut self) {
        *self = unsafe { std::mem::zeroed() };
    }
}

/// One host record. Byte-range lockable at the CON/TFC/EC/HS offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostStatus {
    pub alias: [u8; MAX_ALIAS_LEN],
    pub real_hostname: [[u8; MAX_HOSTNAME_LEN]; 2],
    pub host_toggle: u8,
    pub error_history: [u8; ERROR_HISTORY_LEN],
    pub file_size_offset: i8,
    // CON region
    pub active_transfers: i32,
    pub allowed_transfers: i32,
    // TFC region
    pub total_file_counter: i32,
    pub total_file_size: u64,
    // EC region; the reserved word keeps the HS region out of the EC lock
    // range.
    pub error_counter: i32,
    pub ec_reserved: i32,
    // HS region
    pub host_status: u32,
    pub protocol_options: u32,
    pub trl_per_process: u64,
    pub block_size: u32,
    pub transfer_timeout: u32,
    pub keep_connected: u32,
    pub disconnect_after: u32,
    pub slots: [JobSlot; MAX_JOB_SLOTS],
}

impl HostStatus {
    pub fn alias(&self) -> &str {
        read_cstr(&self.alias)
    }

    pub fn set_alias(&mut self, alias: &str) {
        write_cstr(&mut self.alias, alias);
    }

    /// Hostname for the current toggle (1 or 2). A host without a secondary
    /// name always answers the primary.
    pub fn hostname(&self) -> &str {
        let idx = if self.host_toggle == 2 && self.real_hostname[1][0] != 0 { 1 } else { 0 };
        read_cstr(&self.real_hostname[idx])
    }

    pub fn set_hostnames(&mut self, primary: &str, secondary: Option<&str>) {
        write_cstr(&mut self.real_hostname[0], primary);
        match secondary {
            Some(s) => write_cstr(&mut self.real_hostname[1], s),
            None => self.real_hostname[1].fill(0),
        }
    }

    pub fn has_option(&self, bit: u32) -> bool {
        self.protocol_options & bit != 0
    }

    /// Subtract undelivered work from the host totals, clamping instead of
    /// going negative. Returns true when clamping fired, so callers can log
    /// the inconsistency.
    pub fn sub_totals_checked(&mut self, files: i32, bytes: u64) -> bool {
        let mut clamped = false;
        if self.total_file_counter >= files {
            self.total_file_counter -= files;
        } else {
            self.total_file_counter = 0;
            clamped = true;
        }
        if self.total_file_size >= bytes {
            self.total_file_size -= bytes;
        } else {
            self.total_file_size = 0;
            clamped = true;
        }
        clamped
    }

    /// Shift a fresh result into the error history, newest first.
    pub fn push_error_history(&mut self, code: u8) {
        for i in (1..ERROR_HISTORY_LEN).rev() {
            self.error_history[i] = self.error_history[i - 1];
        }
        self.error_history[0] = code;
    }
}

/// Named lock regions inside one host record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Connection count (`active_transfers`).
    Con,
    /// Total file counter and size.
    Tfc,
    /// Error counter.
    Ec,
    /// Host status flag word.
    Hs,
}

impl Region {
    fn field_offset(self) -> usize {
        match self {
            Region::Con => std::mem::offset_of!(HostStatus, active_transfers),
            Region::Tfc => std::mem::offset_of!(HostStatus, total_file_counter),
            Region::Ec => std::mem::offset_of!(HostStatus, error_counter),
            Region::Hs => std::mem::offset_of!(HostStatus, host_status),
        }
    }
}

/// Attached host status area.
pub struct FsaArea {
    area: MappedArea,
    id_path: PathBuf,
}

pub const FSA_FILE: &str = "fifo/fsa";
pub const FSA_ID_FILE: &str = "fifo/fsa.id";

impl FsaArea {
    pub fn attach(work_dir: &Path) -> Result<Self, StatusAreaError> {
        let path = work_dir.join(FSA_FILE);
        let area =
            MappedArea::attach(&path, FSA_MAGIC, std::mem::size_of::<HostStatus>(), "fsa")?;
        Ok(Self { area, id_path: work_dir.join(FSA_ID_FILE) })
    }

    /// Create a fresh area with `hosts` zeroed records. The dispatcher side
    /// owns this in production; tests use it to stage fixtures.
    pub fn create(work_dir: &Path, area_id: u32, hosts: usize) -> Result<Self, StatusAreaError> {
        let path = work_dir.join(FSA_FILE);
        let area = MappedArea::create(
            &path,
            FSA_MAGIC,
            area_id,
            hosts,
            std::mem::size_of::<HostStatus>(),
        )?;
        let id_path = work_dir.join(FSA_ID_FILE);
        MappedArea::write_id_file(&id_path, area_id)?;
        Ok(Self { area, id_path })
    }

    pub fn host_count(&self) -> usize {
        self.area.header().record_count as usize
    }

    pub fn area_id(&self) -> u32 {
        self.area.header().area_id
    }

    fn record_offset(&self, pos: usize) -> usize {
        AREA_HEADER_LEN + pos * std::mem::size_of::<HostStatus>()
    }

    pub fn host(&self, pos: usize) -> &HostStatus {
        assert!(pos < self.host_count());
        let off = self.record_offset(pos);
        unsafe { &*(self.area.map.as_ptr().add(off) as *const HostStatus) }
    }

    /// Mutable view of a host record. Writers must hold the relevant region
    /// lock while mutating grouped counters.
    #[allow(clippy::mut_from_ref)]
    pub fn host_mut(&self, pos: usize) -> &mut HostStatus {
        assert!(pos < self.host_count());
        let off = self.record_offset(pos);
        unsafe { &mut *(self.area.map.as_ptr().add(off) as *mut HostStatus) }
    }

    /// Find a host by alias; the dispatcher passes a position on argv but
    /// re-location is needed after a stale mapping.
    pub fn find_host(&self, alias: &str) -> Option<usize> {
        (0..self.host_count()).find(|&i| self.host(i).alias() == alias)
    }

    pub fn lock(&self, pos: usize, region: Region) -> std::io::Result<RegionLock<'_>> {
        let offset = self.record_offset(pos) + region.field_offset();
        lock_region(&self.area.file, offset as u64)
    }

    pub fn check_stale(&self) -> Result<(), StatusAreaError> {
        self.area.check_stale(&self.id_path, "fsa")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, FsaArea) {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 1, 2).unwrap();
        (dir, fsa)
    }

    #[test]
    fn create_find_and_mutate() {
        let (_dir, fsa) = fixture();
        {
            let h = fsa.host_mut(0);
            h.set_alias("alpha");
            h.set_hostnames("alpha.example", Some("alpha-b.example"));
            h.host_toggle = 1;
            h.allowed_transfers = 4;
        }
        assert_eq!(fsa.find_host("alpha"), Some(0));
        assert_eq!(fsa.host(0).hostname(), "alpha.example");
        fsa.host_mut(0).host_toggle = 2;
        assert_eq!(fsa.host(0).hostname(), "alpha-b.example");
    }

    #[test]
    fn totals_clamp_instead_of_underflow() {
        let (_dir, fsa) = fixture();
        let h = fsa.host_mut(0);
        h.total_file_counter = 2;
        h.total_file_size = 100;
        assert!(!h.sub_totals_checked(1, 40));
        assert_eq!(h.total_file_counter, 1);
        assert_eq!(h.total_file_size, 60);
        assert!(h.sub_totals_checked(5, 500));
        assert_eq!(h.total_file_counter, 0);
        assert_eq!(h.total_file_size, 0);
    }

    #[test]
    fn error_history_shifts() {
        let (_dir, fsa) = fixture();
        let h = fsa.host_mut(0);
        h.push_error_history(1);
        h.push_error_history(2);
        h.push_error_history(3);
        assert_eq!(&h.error_history[..3], &[3, 2, 1]);
    }

    #[test]
    fn regions_have_distinct_offsets() {
        let offs = [
            Region::Con.field_offset(),
            Region::Tfc.field_offset(),
            Region::Ec.field_offset(),
            Region::Hs.field_offset(),
        ];
        for i in 0..offs.len() {
            for j in i + 1..offs.len() {
                assert!(offs[i].abs_diff(offs[j]) >= 8, "regions overlap: {:?}", offs);
            }
        }
    }

    #[test]
    fn region_lock_round_trip() {
        let (_dir, fsa) = fixture();
        let g = fsa.lock(0, Region::Tfc).unwrap();
        drop(g);
        let _g2 = fsa.lock(0, Region::Tfc).unwrap();
    }

    #[test]
    fn reattach_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fsa = FsaArea::create(dir.path(), 9, 1).unwrap();
            fsa.host_mut(0).set_alias("persist");
        }
        let fsa = FsaArea::attach(dir.path()).unwrap();
        assert_eq!(fsa.area_id(), 9);
        assert_eq!(fsa.host(0).alias(), "persist");
    }

    #[test]
    fn stale_after_id_bump() {
        let dir = tempfile::tempdir().unwrap();
        let fsa = FsaArea::create(dir.path(), 1, 1).unwrap();
        assert!(fsa.check_stale().is_ok());
        MappedArea::write_id_file(&dir.path().join(FSA_ID_FILE), 2).unwrap();
        assert!(fsa.check_stale().is_err());
    }
}
