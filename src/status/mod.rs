//! Shared mmapped status areas.
//!
//! Three fixed-layout tables are shared between the dispatcher, the workers
//! and the UIs: the host status area (send/retrieve hosts with per-slot job
//! progress), the directory status area (retrieve directories) and the peer
//! status area used by the monitor. Records are `#[repr(C)]` and mutated in
//! place through a write mapping; writers serialize through byte-range locks
//! (see `lock`), readers tolerate torn values.

pub mod fra;
pub mod fsa;
pub mod lock;
pub mod msa;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::StatusAreaError;

pub const AREA_VERSION: u32 = 1;

/// Common header at the start of every area file. `area_id` is bumped by the
/// dispatcher whenever it rebuilds the file; attached processes compare it
/// against the sidecar id file to detect a stale mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AreaHeader {
    pub magic: u32,
    pub version: u32,
    pub area_id: u32,
    pub record_count: u32,
}

pub const AREA_HEADER_LEN: usize = std::mem::size_of::<AreaHeader>();

/// NUL-terminated string out of a fixed record field.
pub fn read_cstr(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Store `s` NUL-terminated, truncating to the field width.
pub fn write_cstr(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(0);
}

/// One attached area file: the backing descriptor (lock target) plus the
/// write mapping.
pub struct MappedArea {
    pub(crate) file: File,
    pub(crate) map: MmapMut,
    pub(crate) path: PathBuf,
}

impl MappedArea {
    pub(crate) fn attach(
        path: &Path,
        magic: u32,
        record_size: usize,
        area_name: &str,
    ) -> Result<Self, StatusAreaError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StatusAreaError::Io(format!("{}: {}", path.display(), e)))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StatusAreaError::Io(format!("mmap {}: {}", path.display(), e)))?;
        let area = Self { file, map, path: path.to_path_buf() };
        let header = area.header();
        if header.magic != magic || header.version != AREA_VERSION {
            return Err(StatusAreaError::BadMagic(area_name.to_string()));
        }
        let need = AREA_HEADER_LEN + header.record_count as usize * record_size;
        if area.map.len() < need {
            return Err(StatusAreaError::Truncated(area_name.to_string()));
        }
        Ok(area)
    }

    pub(crate) fn create(
        path: &Path,
        magic: u32,
        area_id: u32,
        record_count: usize,
        record_size: usize,
    ) -> Result<Self, StatusAreaError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StatusAreaError::Io(format!("{}: {}", path.display(), e)))?;
        let len = AREA_HEADER_LEN + record_count * record_size;
        file.set_len(len as u64)
            .map_err(|e| StatusAreaError::Io(format!("{}: {}", path.display(), e)))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StatusAreaError::Io(format!("mmap {}: {}", path.display(), e)))?;
        let mut area = Self { file, map, path: path.to_path_buf() };
        *area.header_mut() = AreaHeader {
            magic,
            version: AREA_VERSION,
            area_id,
            record_count: record_count as u32,
        };
        Ok(area)
    }

    pub(crate) fn header(&self) -> &AreaHeader {
        unsafe { &*(self.map.as_ptr() as *const AreaHeader) }
    }

    pub(crate) fn header_mut(&mut self) -> &mut AreaHeader {
        unsafe { &mut *(self.map.as_mut_ptr() as *mut AreaHeader) }
    }

    /// Compare the mapped id against the sidecar id file the dispatcher
    /// rewrites on area recreation.
    pub(crate) fn check_stale(
        &self,
        id_path: &Path,
        area_name: &str,
    ) -> Result<(), StatusAreaError> {
        let current = std::fs::read_to_string(id_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        match current {
            Some(id) if id == self.header().area_id => Ok(()),
            // Missing id file means nobody recreated the area.
            None => Ok(()),
            Some(_) => Err(StatusAreaError::StaleMapping(area_name.to_string())),
        }
    }

    pub(crate) fn write_id_file(id_path: &Path, area_id: u32) -> Result<(), StatusAreaError> {
        if let Some(parent) = id_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(id_path, format!("{}\n", area_id))
            .map_err(|e| StatusAreaError::Io(format!("{}: {}", id_path.display(), e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_roundtrip() {
        let mut buf = [0u8; 8];
        write_cstr(&mut buf, "abc");
        assert_eq!(read_cstr(&buf), "abc");
        write_cstr(&mut buf, "longer-than-field");
        assert_eq!(read_cstr(&buf), "longer-");
    }

    #[test]
    fn create_and_attach_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("area");
        let a = MappedArea::create(&p, 0x4652_0001, 7, 3, 64).unwrap();
        assert_eq!(a.header().record_count, 3);
        drop(a);
        let b = MappedArea::attach(&p, 0x4652_0001, 64, "test").unwrap();
        assert_eq!(b.header().area_id, 7);
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("area");
        MappedArea::create(&p, 1, 1, 1, 16).unwrap();
        assert!(matches!(
            MappedArea::attach(&p, 2, 16, "test"),
            Err(StatusAreaError::BadMagic(_))
        ));
    }

    #[test]
    fn stale_id_detected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("area");
        let idp = dir.path().join("area.id");
        let a = MappedArea::create(&p, 1, 4, 1, 16).unwrap();
        MappedArea::write_id_file(&idp, 4).unwrap();
        assert!(a.check_stale(&idp, "test").is_ok());
        MappedArea::write_id_file(&idp, 5).unwrap();
        assert!(matches!(
            a.check_stale(&idp, "test"),
            Err(StatusAreaError::StaleMapping(_))
        ));
    }
}
