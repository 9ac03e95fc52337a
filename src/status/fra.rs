//! Directory status area: one record per retrieve directory.

use std::path::{Path, PathBuf};

use crate::error::StatusAreaError;
use crate::status::lock::{RegionLock, lock_region};
use crate::status::{AREA_HEADER_LEN, MappedArea, read_cstr, write_cstr};

pub const MAX_DIR_ALIAS_LEN: usize = 40;
pub const MAX_URL_LEN: usize = 256;
pub const MAX_PATH_LEN: usize = 256;

const FRA_MAGIC: u32 = 0x4652_5241; // "FRRA"

// dir_flag bits
pub const DIR_ERROR_SET: u32 = 1 << 0;
pub const DO_NOT_PARALLELIZE: u32 = 1 << 1;

/// Remote-listing memory policy for a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StupidMode {
    /// Keep the retrieve list across jobs.
    Remember = 0,
    /// Forget everything between jobs; every job re-scans from scratch.
    Forget = 1,
    /// Only append-tracking survives; sizes are re-probed.
    AppendOnly = 2,
}

impl StupidMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => StupidMode::Forget,
            2 => StupidMode::AppendOnly,
            _ => StupidMode::Remember,
        }
    }
}

/// One retrieve-directory record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirStatus {
    pub alias: [u8; MAX_DIR_ALIAS_LEN],
    pub url: [u8; MAX_URL_LEN],
    pub retrieve_work_dir: [u8; MAX_PATH_LEN],
    pub dir_mode: u32,
    pub dir_flag: u32,
    pub stupid_mode: u8,
    pub remove: u8,
    pub force_reread: u8,
    pub dir_status: u8,
    // EC region
    pub error_counter: i32,
    pub dir_mtime: i64,
    pub start_event_handle: i64,
    pub end_event_handle: i64,
}

impl DirStatus {
    pub fn alias(&self) -> &str {
        read_cstr(&self.alias)
    }

    pub fn set_alias(&mut self, alias: &str) {
        write_cstr(&mut self.alias, alias);
    }

    pub fn url(&self) -> &str {
        read_cstr(&self.url)
    }

    pub fn set_url(&mut self, url: &str) {
        write_cstr(&mut self.url, url);
    }

    pub fn retrieve_work_dir(&self) -> &str {
        read_cstr(&self.retrieve_work_dir)
    }

    pub fn set_retrieve_work_dir(&mut self, p: &str) {
        write_cstr(&mut self.retrieve_work_dir, p);
    }

    pub fn stupid_mode(&self) -> StupidMode {
        StupidMode::from_u8(self.stupid_mode)
    }

    /// Whether the retrieve list file should be dropped on detach.
    pub fn forgets_listings(&self) -> bool {
        self.stupid_mode() == StupidMode::Forget || self.remove != 0
    }
}

pub const FRA_FILE: &str = "fifo/fra";
pub const FRA_ID_FILE: &str = "fifo/fra.id";

/// Attached directory status area.
pub struct FraArea {
    area: MappedArea,
    id_path: PathBuf,
}

impl FraArea {
    pub fn attach(work_dir: &Path) -> Result<Self, StatusAreaError> {
        let path = work_dir.join(FRA_FILE);
        let area =
            MappedArea::attach(&path, FRA_MAGIC, std::mem::size_of::<DirStatus>(), "fra")?;
        Ok(Self { area, id_path: work_dir.join(FRA_ID_FILE) })
    }

    pub fn create(work_dir: &Path, area_id: u32, dirs: usize) -> Result<Self, StatusAreaError> {
        let path = work_dir.join(FRA_FILE);
        let area = MappedArea::create(
            &path,
            FRA_MAGIC,
            area_id,
            dirs,
            std::mem::size_of::<DirStatus>(),
        )?;
        let id_path = work_dir.join(FRA_ID_FILE);
        MappedArea::write_id_file(&id_path, area_id)?;
        Ok(Self { area, id_path })
    }

    pub fn dir_count(&self) -> usize {
        self.area.header().record_count as usize
    }

    fn record_offset(&self, pos: usize) -> usize {
        AREA_HEADER_LEN + pos * std::mem::size_of::<DirStatus>()
    }

    pub fn dir(&self, pos: usize) -> &DirStatus {
        assert!(pos < self.dir_count());
        let off = self.record_offset(pos);
        unsafe { &*(self.area.map.as_ptr().add(off) as *const DirStatus) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn dir_mut(&self, pos: usize) -> &mut DirStatus {
        assert!(pos < self.dir_count());
        let off = self.record_offset(pos);
        unsafe { &mut *(self.area.map.as_ptr().add(off) as *mut DirStatus) }
    }

    pub fn find_dir(&self, alias: &str) -> Option<usize> {
        (0..self.dir_count()).find(|&i| self.dir(i).alias() == alias)
    }

    /// Lock the directory's error-counter region.
    pub fn lock_ec(&self, pos: usize) -> std::io::Result<RegionLock<'_>> {
        let offset =
            self.record_offset(pos) + std::mem::offset_of!(DirStatus, error_counter);
        lock_region(&self.area.file, offset as u64)
    }

    pub fn check_stale(&self) -> Result<(), StatusAreaError> {
        self.area.check_stale(&self.id_path, "fra")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let fra = FraArea::create(dir.path(), 1, 2).unwrap();
        {
            let d = fra.dir_mut(1);
            d.set_alias("inbound");
            d.set_url("sftp://user@peer//data/out");
            d.stupid_mode = StupidMode::Forget as u8;
        }
        assert_eq!(fra.find_dir("inbound"), Some(1));
        assert!(fra.dir(1).forgets_listings());
        assert_eq!(fra.dir(0).stupid_mode(), StupidMode::Remember);
    }

    #[test]
    fn remove_flag_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let fra = FraArea::create(dir.path(), 1, 1).unwrap();
        let d = fra.dir_mut(0);
        d.remove = 1;
        assert!(d.forgets_listings());
    }

    #[test]
    fn ec_lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fra = FraArea::create(dir.path(), 1, 1).unwrap();
        let g = fra.lock_ec(0).unwrap();
        drop(g);
        let _g = fra.lock_ec(0).unwrap();
    }
}
