//! Metrics for the harvester daemon.
//!
//! Tracks run outcomes, emitted batches and run duration percentiles.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters for daemon activity.
pub struct Metrics {
    /// Runs admitted past the throttle
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    /// Triggers rejected by the throttle or an in-flight run
    pub runs_throttled: AtomicU64,
    pub batches_emitted: AtomicU64,
    /// Sum of completed run durations in microseconds
    pub run_latency_us: AtomicU64,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_throttled: AtomicU64::new(0),
            batches_emitted: AtomicU64::new(0),
            run_latency_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed run and the batches it emitted.
    pub fn record_completed(&self, duration: Duration, batches: u32) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.batches_emitted
            .fetch_add(u64::from(batches), Ordering::Relaxed);
        self.run_latency_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.runs_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Average duration of completed runs.
    pub fn avg_run_duration(&self) -> Duration {
        let total = self.runs_completed.load(Ordering::Relaxed);
        let latency_us = self.run_latency_us.load(Ordering::Relaxed);
        if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(latency_us / total)
        }
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: RwLock<VecDeque<(String, Duration)>>,
    max_samples: usize,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LatencyTracker {
    /// Create a new latency tracker with given capacity.
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(max_samples)),
            max_samples,
        }
    }

    /// Record a latency sample for an operation.
    pub fn record(&self, operation: &str, duration: Duration) {
        let mut samples = self.samples.write();
        samples.push_back((operation.to_string(), duration));

        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    pub fn p50(&self, operation: &str) -> Duration {
        self.percentile(operation, 0.50)
    }

    pub fn p99(&self, operation: &str) -> Duration {
        self.percentile(operation, 0.99)
    }

    /// Get specific percentile for an operation.
    pub fn percentile(&self, operation: &str, p: f64) -> Duration {
        let samples = self.samples.read();
        let mut durations: Vec<_> = samples
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, d)| *d)
            .collect();

        if durations.is_empty() {
            return Duration::ZERO;
        }

        durations.sort();
        let idx = ((durations.len() as f64 * p) as usize).min(durations.len() - 1);
        durations[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_counters() {
        let metrics = Metrics::new();
        metrics.record_started();
        metrics.record_started();
        metrics.record_completed(Duration::from_millis(10), 2);
        metrics.record_completed(Duration::from_millis(30), 1);
        metrics.record_failed();
        metrics.record_throttled();

        assert_eq!(metrics.runs_started.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.runs_completed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.runs_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.runs_throttled.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.batches_emitted.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.avg_run_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_avg_duration_without_runs() {
        assert_eq!(Metrics::new().avg_run_duration(), Duration::ZERO);
    }

    #[test]
    fn test_latency_percentiles() {
        let tracker = LatencyTracker::new(200);
        for i in 1..=100 {
            tracker.record("run", Duration::from_millis(i));
        }
        tracker.record("other", Duration::from_secs(5));

        assert_eq!(tracker.p50("run"), Duration::from_millis(51));
        assert_eq!(tracker.p99("run"), Duration::from_millis(100));
        assert_eq!(tracker.p99("missing"), Duration::ZERO);
    }

    #[test]
    fn test_latency_tracker_evicts_oldest() {
        let tracker = LatencyTracker::new(2);
        tracker.record("run", Duration::from_secs(9));
        tracker.record("run", Duration::from_millis(1));
        tracker.record("run", Duration::from_millis(2));

        assert_eq!(tracker.p99("run"), Duration::from_millis(2));
    }
}
