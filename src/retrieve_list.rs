//! Per-directory retrieve list: the durable record of what the remote
//! directory contained and which worker owns which file.
//!
//! The list is a memory-mapped file so parallel helper workers cooperate on
//! one work list. Only the initial claim races; it is a compare-and-swap on
//! the `assigned` byte. Every other field of an entry is written solely by
//! the worker that owns the claim, so no further locking is needed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapMut;

use crate::error::RetrieveListError;

pub const RL_NAME_LEN: usize = 192;
const RL_MAGIC: u32 = 0x4652_524C; // "FRRL"
const RL_VERSION: u32 = 1;
const RL_HEADER_LEN: usize = 16;

/// Size value meaning "remote did not report a size".
pub const RL_SIZE_UNKNOWN: i64 = -1;

/// One observed remote file.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RlEntry {
    pub file_name: [u8; RL_NAME_LEN],
    pub size: i64,
    pub prev_size: i64,
    pub file_mtime: i64,
    pub got_date: i64,
    pub retrieved: u8,
    pub assigned: u8,
    pub in_list: u8,
    pub special: u8,
    pub pad: u32,
}

impl RlEntry {
    pub fn file_name(&self) -> &str {
        crate::status::read_cstr(&self.file_name)
    }
}

/// Attached retrieve list for one directory.
pub struct RetrieveList {
    file: std::fs::File,
    map: MmapMut,
    path: PathBuf,
}

fn rl_path(work_dir: &Path, dir_alias: &str) -> PathBuf {
    work_dir.join("rl").join(dir_alias)
}

impl RetrieveList {
    /// Attach the directory's list, creating an empty one when this is the
    /// first scan.
    pub fn attach(work_dir: &Path, dir_alias: &str) -> Result<Self, RetrieveListError> {
        let path = rl_path(work_dir, dir_alias);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RetrieveListError::Io(e.to_string()))?;
        }
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RetrieveListError::Io(e.to_string()))?;
        if !exists {
            file.set_len(RL_HEADER_LEN as u64)
                .map_err(|e| RetrieveListError::Io(e.to_string()))?;
        }
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| RetrieveListError::Io(e.to_string()))?;
        let mut rl = Self { file, map, path };
        if !exists {
            rl.write_header(0);
        } else if rl.magic() != RL_MAGIC {
            return Err(RetrieveListError::Io(format!(
                "{}: not a retrieve list",
                rl.path.display()
            )));
        }
        Ok(rl)
    }

    fn magic(&self) -> u32 {
        u32::from_le_bytes(self.map[0..4].try_into().unwrap())
    }

    fn write_header(&mut self, count: u32) {
        self.map[0..4].copy_from_slice(&RL_MAGIC.to_le_bytes());
        self.map[4..8].copy_from_slice(&RL_VERSION.to_le_bytes());
        self.map[8..12].copy_from_slice(&count.to_le_bytes());
        self.map[12..16].fill(0);
    }

    pub fn len(&self) -> usize {
        u32::from_le_bytes(self.map[8..12].try_into().unwrap()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_offset(&self, i: usize) -> usize {
        RL_HEADER_LEN + i * std::mem::size_of::<RlEntry>()
    }

    pub fn entry(&self, i: usize) -> Result<&RlEntry, RetrieveListError> {
        if i >= self.len() {
            return Err(RetrieveListError::OutOfRange(i));
        }
        let off = self.entry_offset(i);
        Ok(unsafe { &*(self.map.as_ptr().add(off) as *const RlEntry) })
    }

    /// Mutable entry access for the owning worker or the scanner.
    pub fn entry_mut(&mut self, i: usize) -> Result<&mut RlEntry, RetrieveListError> {
        if i >= self.len() {
            return Err(RetrieveListError::OutOfRange(i));
        }
        let off = self.entry_offset(i);
        Ok(unsafe { &mut *(self.map.as_mut_ptr().add(off) as *mut RlEntry) })
    }

    fn assigned_atomic(&self, i: usize) -> &AtomicU8 {
        let off = self.entry_offset(i) + std::mem::offset_of!(RlEntry, assigned);
        unsafe { AtomicU8::from_ptr(self.map.as_ptr().add(off) as *mut u8) }
    }

    /// Claim entry `i` for `slot_id`. Loses with `AlreadyClaimed` when
    /// another worker got there first.
    pub fn claim(&self, i: usize, slot_id: usize) -> Result<(), RetrieveListError> {
        if i >= self.len() {
            return Err(RetrieveListError::OutOfRange(i));
        }
        let a = self.assigned_atomic(i);
        match a.compare_exchange(0, slot_id as u8 + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(_) => Err(RetrieveListError::AlreadyClaimed(i)),
        }
    }

    pub fn release(&self, i: usize) -> Result<(), RetrieveListError> {
        if i >= self.len() {
            return Err(RetrieveListError::OutOfRange(i));
        }
        self.assigned_atomic(i).store(0, Ordering::Release);
        Ok(())
    }

    /// Mark entry `i` done. A retrieved entry is never assigned.
    pub fn mark_retrieved(&mut self, i: usize) -> Result<(), RetrieveListError> {
        let e = self.entry_mut(i)?;
        e.retrieved = 1;
        e.assigned = 0;
        Ok(())
    }

    /// Clear every claim held by `slot_id`. Runs on all worker exit paths.
    pub fn release_all_for_slot(&self, slot_id: usize) {
        let tag = slot_id as u8 + 1;
        for i in 0..self.len() {
            let a = self.assigned_atomic(i);
            let _ = a.compare_exchange(tag, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Indices this worker may process: claimed by it and not yet retrieved.
    pub fn claimed_by(&self, slot_id: usize) -> Vec<usize> {
        let tag = slot_id as u8 + 1;
        (0..self.len())
            .filter(|&i| {
                self.entry(i)
                    .map(|e| e.assigned == tag && e.retrieved == 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Append a newly observed remote file. The scanner side calls this;
    /// workers call it for files appearing between scans.
    pub fn push(
        &mut self,
        name: &str,
        size: i64,
        mtime: i64,
        got_date: i64,
    ) -> Result<usize, RetrieveListError> {
        let count = self.len();
        let new_len = self.entry_offset(count) + std::mem::size_of::<RlEntry>();
        self.file
            .set_len(new_len as u64)
            .map_err(|e| RetrieveListError::Io(e.to_string()))?;
        self.map = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| RetrieveListError::Io(e.to_string()))?;
        self.write_header(count as u32 + 1);
        let e = self.entry_mut(count)?;
        *e = unsafe { std::mem::zeroed() };
        crate::status::write_cstr(&mut e.file_name, name);
        e.size = size;
        e.prev_size = RL_SIZE_UNKNOWN;
        e.file_mtime = mtime;
        e.got_date = got_date;
        e.in_list = 1;
        Ok(count)
    }

    /// Find an entry by remote name.
    pub fn find(&self, name: &str) -> Option<usize> {
        (0..self.len()).find(|&i| self.entry(i).map(|e| e.file_name() == name).unwrap_or(false))
    }

    /// Drop entries no longer observed remotely. Called between jobs, never
    /// while claims are live.
    pub fn prune_unlisted(&mut self) -> Result<usize, RetrieveListError> {
        let count = self.len();
        let mut kept: Vec<RlEntry> = Vec::with_capacity(count);
        for i in 0..count {
            let e = self.entry(i)?;
            if e.in_list != 0 {
                kept.push(*e);
            }
        }
        let removed = count - kept.len();
        if removed > 0 {
            for (i, e) in kept.iter().enumerate() {
                *self.entry_mut(i)? = *e;
            }
            self.write_header(kept.len() as u32);
            let new_len = self.entry_offset(kept.len());
            self.file
                .set_len(new_len as u64)
                .map_err(|e| RetrieveListError::Io(e.to_string()))?;
            self.map = unsafe { MmapMut::map_mut(&self.file) }
                .map_err(|e| RetrieveListError::Io(e.to_string()))?;
        }
        Ok(removed)
    }

    /// Detach the list. With `preserve = false` (one-shot directory policy)
    /// the backing file is discarded so the next job re-scans from scratch.
    pub fn detach(self, preserve: bool) -> Result<(), RetrieveListError> {
        let path = self.path.clone();
        drop(self);
        if !preserve {
            std::fs::remove_file(&path).map_err(|e| RetrieveListError::Io(e.to_string()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
