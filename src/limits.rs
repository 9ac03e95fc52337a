//! Transfer-rate ceiling and per-file wall-clock guard.

use std::time::{Duration, Instant};

/// Clock ticks per second from the host, needed to round limiter sleeps to
/// scheduler granularity.
pub fn clock_ticks_per_second() -> u64 {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 { 100 } else { v as u64 }
}

/// Keeps the moving average of streamed bytes under a bytes-per-second
/// ceiling by sleeping the minimum shortfall after each block.
pub struct RateLimiter {
    total_bytes: u64,
    start: Instant,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::init()
    }
}

impl RateLimiter {
    pub fn init() -> Self {
        Self { total_bytes: 0, start: Instant::now() }
    }

    /// Account `bytes` just transferred and sleep if the average rate is
    /// above `ceiling_bps`. A ceiling of 0 disables limiting. Sleeps are
    /// rounded up to whole clock ticks so we do not busy-spin on sub-tick
    /// shortfalls.
    pub fn tick(&mut self, bytes: u64, ceiling_bps: u64, clk_tck: u64) {
        self.total_bytes += bytes;
        if ceiling_bps == 0 {
            return;
        }
        let expected = Duration::from_secs_f64(self.total_bytes as f64 / ceiling_bps as f64);
        let elapsed = self.start.elapsed();
        if expected > elapsed {
            let shortfall = expected - elapsed;
            let tick = Duration::from_secs_f64(1.0 / clk_tck.max(1) as f64);
            let ticks = (shortfall.as_secs_f64() / tick.as_secs_f64()).ceil() as u32;
            std::thread::sleep(tick * ticks);
        }
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.total_bytes
    }
}

/// Wall-clock ceiling for a single file transfer. Exceeding it aborts the
/// file with a requeue status, not a host error, so the dispatcher retries.
pub struct TransferTimeout {
    limit: Option<Duration>,
    start_transfer_time_file: Instant,
}

impl TransferTimeout {
    /// `limit_secs == 0` disables the guard.
    pub fn new(limit_secs: u32) -> Self {
        let limit =
            if limit_secs == 0 { None } else { Some(Duration::from_secs(limit_secs as u64)) };
        Self { limit, start_transfer_time_file: Instant::now() }
    }

    /// Re-arm at the start of each file.
    pub fn start_file(&mut self) {
        self.start_transfer_time_file = Instant::now();
    }

    pub fn exceeded(&self) -> bool {
        match self.limit {
            Some(limit) => self.start_transfer_time_file.elapsed() > limit,
            None => false,
        }
    }
}
