use crate::utils::format_file_size;
use std::time::{Duration, Instant};
use tracing::info;

/// Samples bytes moved over a window and logs the rate once per interval.
/// Purely informational.
#[derive(Debug)]
pub struct ThroughputMeter {
    label: String,
    interval: Duration,
    window_start: Instant,
    window_bytes: u64,
    total_bytes: u64,
}

impl ThroughputMeter {
    pub fn new(label: impl Into<String>, interval: Duration) -> Self {
        Self {
            label: label.into(),
            interval,
            window_start: Instant::now(),
            window_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Returns the bytes-per-second rate when a sample was emitted.
    pub fn record(&mut self, bytes: usize) -> Option<u64> {
        self.window_bytes += bytes as u64;
        self.total_bytes += bytes as u64;

        let elapsed = self.window_start.elapsed();
        if self.interval.is_zero() || elapsed < self.interval {
            return None;
        }

        let rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
        info!(
            "{}: {}/s ({} so far)",
            self.label,
            format_file_size(rate),
            format_file_size(self.total_bytes)
        );

        self.window_start = Instant::now();
        self.window_bytes = 0;
        Some(rate)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_sample_before_interval() {
        let mut meter = ThroughputMeter::new("test", Duration::from_secs(3600));
        assert_eq!(meter.record(100), None);
        assert_eq!(meter.record(50), None);
        assert_eq!(meter.total_bytes(), 150);
    }

    #[test]
    fn test_sample_after_interval() {
        let mut meter = ThroughputMeter::new("test", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(meter.record(1024).is_some());
        assert_eq!(meter.total_bytes(), 1024);
    }
}
