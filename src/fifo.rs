//! Named-FIFO plumbing between workers, the dispatcher and the monitor.
//!
//! All inter-process nudging in this system is a byte through a FIFO: the
//! dispatcher wake-up, the "start more helpers" hint, the monitor command
//! channel and its probe reply. Systems without read-write FIFO support need
//! the reader and writer ends opened separately, so `Fifo` always holds both.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

pub const FD_WAKE_UP_FIFO: &str = "fifo/fd_wake_up.fifo";
pub const RECEIVE_LOG_FIFO: &str = "fifo/receive_log.fifo";
pub const TRANSFER_LOG_FIFO: &str = "fifo/transfer_log.fifo";
pub const SYSTEM_LOG_FIFO: &str = "fifo/system_log.fifo";
pub const MONITOR_LOG_FIFO: &str = "fifo/monitor_log.fifo";
pub const MON_CMD_FIFO: &str = "fifo/mon_cmd.fifo";
pub const PROBE_ONLY_FIFO: &str = "fifo/probe_only.fifo";

/// Create the FIFO node if it does not exist yet. Racing creators are fine;
/// EEXIST is success.
pub fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o660) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}

/// A FIFO opened on both ends. Holding the writer end ourselves keeps reads
/// from hitting EOF when the last external writer closes.
pub struct Fifo {
    path: PathBuf,
    reader: File,
    writer: File,
}

impl Fifo {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        ensure_fifo(path)?;
        // Nonblocking read end first so the open does not hang waiting for a
        // writer; the write end then always finds a reader.
        let reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        let writer = OpenOptions::new().write(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), reader, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a single wake byte. Losing the byte because the FIFO is full is
    /// acceptable; the peer is already scheduled to look.
    pub fn nudge(&mut self) -> std::io::Result<()> {
        match self.writer.write(&[b'\0']) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write an arbitrary small datagram-style record.
    pub fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)
    }

    /// Drain whatever is currently readable, without blocking.
    pub fn drain(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Open a FIFO write-only for one-shot nudges from short-lived workers.
/// Returns None when no reader exists yet (the dispatcher is not up); the
/// nudge is then meaningless anyway.
pub fn open_writer(path: &Path) -> Option<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .ok()
}

/// One wake byte toward the dispatcher, best-effort.
pub fn wake_dispatcher(work_dir: &Path) {
    let path = work_dir.join(FD_WAKE_UP_FIFO);
    if let Some(mut f) = open_writer(&path) {
        let _ = f.write(&[b'\0']);
    }
}

/// One line into a log FIFO, best-effort. The log shippers on the other
/// end are separate programs; a missing reader just drops the record.
pub fn send_log_record(work_dir: &Path, fifo_name: &str, record: &str) {
    let path = work_dir.join(fifo_name);
    if let Some(mut f) = open_writer(&path) {
        let _ = writeln!(f, "{}", record);
    }
}
