//! Byte-range write locks over the mmapped status areas.
//!
//! Four named regions per host record (CON, TFC, EC, HS) serialize all
//! writers. A lock is held only while the related counters are mutated,
//! never across I/O; the guard releases on every exit path including
//! unwinding.

use std::fs::File;
use std::os::fd::AsRawFd;

/// Width of one locked region. All counters grouped under a region fit
/// within it; readers never lock.
const REGION_LEN: i64 = 8;

/// Acquired byte-range write lock. Dropping the guard unlocks.
pub struct RegionLock<'a> {
    file: &'a File,
    offset: i64,
}

fn fcntl_lock(fd: i32, lock_type: i16, offset: i64) -> std::io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = offset as libc::off_t;
    fl.l_len = REGION_LEN as libc::off_t;
    // F_SETLKW: block until the competing writer drops its lock. Region
    // holders only mutate a handful of fields, so waits are short.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
    if rc == -1 { Err(std::io::Error::last_os_error()) } else { Ok(()) }
}

/// Lock the region at `offset` (absolute file offset) for writing.
pub fn lock_region(file: &File, offset: u64) -> std::io::Result<RegionLock<'_>> {
    fcntl_lock(file.as_raw_fd(), libc::F_WRLCK as i16, offset as i64)?;
    Ok(RegionLock { file, offset: offset as i64 })
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        let _ = fcntl_lock(self.file.as_raw_fd(), libc::F_UNLCK as i16, self.offset);
    }
}

/// Explicit unlock for call sites that want the error.
pub fn unlock_region(file: &File, offset: u64) -> std::io::Result<()> {
    fcntl_lock(file.as_raw_fd(), libc::F_UNLCK as i16, offset as i64)
}
