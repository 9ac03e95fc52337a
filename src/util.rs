use anyhow::Result;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::WorkerError;

/// Convert a byte count into a human readable string using IEC units.
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Initialize tracing for a worker or monitor process. All output goes to
/// `<work_dir>/log/<prog>.log`; nothing is drawn on the console since these
/// processes have no terminal. If the log file cannot be opened the process
/// runs without tracing and leaves a single note on stderr.
pub fn init_tracing(work_dir: &Path, prog: &str, debug: bool) {
    let logs_dir = work_dir.join("log");
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join(format!("{}.log", prog));
    let level_str = if debug { "debug" } else { "info" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file);
            // Keep the background writer thread alive for the process
            // lifetime; dropping the guard would lose buffered lines.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            // try_init: a second call (bursted tests, double setup) is a
            // no-op rather than a panic.
            let _ = tracing_subscriber::registry().with(file_layer).try_init();
        }
        Err(e) => {
            eprintln!("warning: could not open log at {}: {}", log_path.display(), e);
        }
    }
}

/// Write structured failures as JSON Lines under `<work_dir>/log/`.
/// Returns the path written, if any.
pub fn write_failures_jsonl(work_dir: &Path, job: &str, failures: &[WorkerError]) -> Option<PathBuf> {
    if failures.is_empty() {
        return None;
    }
    let dir = work_dir.join("log");
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("failures.jsonl");
    let mut f = OpenOptions::new().create(true).append(true).open(&path).ok()?;
    for err in failures {
        let obj = serde_json::json!({
            "time": Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            "job": job,
            "status": err.status().code(),
            "message": err.to_string(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(f, "{}", line);
        }
    }
    Some(path)
}

// Default backoff base in milliseconds. Adjustable at runtime for tests and
// the `-o retries` option.
static BACKOFF_BASE_MS: AtomicU64 = AtomicU64::new(100);

pub fn set_backoff_ms(ms: u64) {
    BACKOFF_BASE_MS.store(ms, Ordering::SeqCst);
}

pub fn get_backoff_ms() -> u64 {
    BACKOFF_BASE_MS.load(Ordering::SeqCst)
}

/// Linear backoff for the given 1-based attempt.
pub fn compute_backoff_ms(base: u64, attempt: u64) -> u64 {
    base.saturating_mul(attempt)
}

/// Generic retry helper for transient local failures (EBUSY unlinks, FIFO
/// opens). `op` is retried up to `max_retries` times with linear backoff.
pub fn retry_operation<F, T>(max_retries: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..max_retries {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < max_retries {
                    let base = BACKOFF_BASE_MS.load(Ordering::SeqCst);
                    let wait = compute_backoff_ms(base, attempt as u64 + 1);
                    std::thread::sleep(Duration::from_millis(wait));
                    continue;
                } else {
                    break;
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| WorkerError::Incorrect("operation failed without error".into()).into()))
}

/// Remove a local file, retrying briefly when the kernel reports EBUSY
/// (another process still holds the spool file open).
pub fn unlink_with_busy_retry(path: &Path) -> std::io::Result<()> {
    let mut attempt = 0u64;
    loop {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                let busy = e.raw_os_error() == Some(libc::EBUSY);
                attempt += 1;
                if !busy || attempt >= 5 {
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(compute_backoff_ms(50, attempt)));
            }
        }
    }
}
