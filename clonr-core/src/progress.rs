//! Throughput measurement and human-readable size formatting.
use std::time::{Duration, Instant};

const MEGA_BYTES: f64 = 1024.0 * 1024.0;

/// Formats a size as megabytes below 1000 MB and as gigabytes above, with
/// two decimals.
pub fn format_disk_size(size_bytes: u64) -> String {
    let size_mb = size_bytes as f64 / MEGA_BYTES;
    if size_mb < 1000.0 {
        format!("{:.2} MB", round_to(size_mb, 2))
    } else {
        format!("{:.2} GB", round_to(size_mb / 1024.0, 2))
    }
}

fn round_to(value: f64, precision: i32) -> f64 {
    let p = 10f64.powi(precision);
    (value * p + 0.5).floor() / p
}

/// A throughput sample, in MB/s (1 MB = 2^20 bytes).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Throughput(pub f64);

impl Throughput {
    pub fn mb_per_sec(&self) -> f64 {
        self.0
    }
}

/// Turns a monotonically increasing byte position into throughput samples,
/// one per elapsed tick.
#[derive(Debug)]
pub struct ThroughputMeter {
    interval: Duration,
    tick_started: Instant,
    position_at_tick: u64,
}

impl ThroughputMeter {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            tick_started: now,
            position_at_tick: 0,
        }
    }

    /// Reports the current byte position. Returns a sample once at least one
    /// interval has elapsed since the previous sample, computed from the bytes
    /// moved since then.
    pub fn observe(&mut self, now: Instant, position: u64) -> Option<Throughput> {
        let elapsed = now.saturating_duration_since(self.tick_started);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let moved = position.saturating_sub(self.position_at_tick) as f64;
        let sample = Throughput(moved / elapsed.as_secs_f64() / MEGA_BYTES);

        self.position_at_tick = position;
        self.tick_started = now;
        Some(sample)
    }
}
