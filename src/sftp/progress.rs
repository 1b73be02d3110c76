//! Progress arithmetic for streamed transfers

use std::time::Duration;

use tokio::time::Instant;

/// Rounded percentage; an empty file counts as complete.
pub fn percentage(transferred: u64, total: u64) -> u32 {
    if total == 0 {
        return 100;
    }
    ((transferred as f64 / total as f64) * 100.0).round().min(100.0) as u32
}

/// Human readable throughput, e.g. `1.5 MB/s`
pub fn format_speed(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes_per_sec, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Instantaneous throughput between consecutive chunk boundaries
pub struct SpeedMeter {
    started: Instant,
    last: Instant,
}

impl SpeedMeter {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
        }
    }

    /// Record a chunk of `bytes` and return bytes/sec since the previous chunk.
    pub fn record(&mut self, bytes: usize) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        if elapsed.is_zero() {
            // Sub-resolution chunk: report the raw size rather than infinity
            return bytes as u64;
        }
        (bytes as f64 / elapsed.as_secs_f64()) as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
