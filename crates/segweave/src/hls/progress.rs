// Progress reporting: an observational side channel fed by the fetch workers.
// Nothing in here feeds back into scheduling.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Receives per-segment completion events. Called concurrently from every
/// worker, so implementations must synchronize their own state.
pub trait ProgressHook: Send + Sync {
    /// Called once, before any segment is submitted
    fn set_total(&self, total: usize);

    /// A segment body arrived: its size and how long the GET took
    fn on_unit_complete(&self, bytes_received: u64, elapsed: Duration);

    /// A segment task finished, successfully or not. Exactly once per segment.
    fn on_unit_attempted(&self);

    /// The job is over
    fn finish(&self) {}
}

/// Hook for callers that render nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressHook for NoopProgress {
    fn set_total(&self, _total: usize) {}
    fn on_unit_complete(&self, _bytes_received: u64, _elapsed: Duration) {}
    fn on_unit_attempted(&self) {}
}

/// Point-in-time view of a running job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub attempted: usize,
    pub completed: usize,
    pub bytes_received: u64,
    /// Bytes per second over the wall-clock time since the job started
    pub rate: f64,
    pub average_segment_size: u64,
    /// Average segment size times total segments, once anything has arrived
    pub estimated_total_size: Option<u64>,
    /// Mean request time of completed segments
    pub average_request_time: Duration,
}

/// Thread-safe accumulator behind the progress hook.
#[derive(Debug)]
pub struct ThroughputEstimator {
    total: AtomicUsize,
    attempted: AtomicUsize,
    completed: AtomicUsize,
    bytes: AtomicU64,
    request_nanos: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Self {
            total: AtomicUsize::new(0),
            attempted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            request_nanos: AtomicU64::new(0),
            started: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let bytes_received = self.bytes.load(Ordering::Relaxed);
        let wall = self
            .started
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();

        let rate = if wall.is_zero() {
            0.0
        } else {
            bytes_received as f64 / wall.as_secs_f64()
        };
        let (average_segment_size, average_request_time) = if completed == 0 {
            (0, Duration::ZERO)
        } else {
            let nanos = self.request_nanos.load(Ordering::Relaxed) / completed as u64;
            (bytes_received / completed as u64, Duration::from_nanos(nanos))
        };

        ProgressSnapshot {
            total,
            attempted: self.attempted.load(Ordering::Relaxed),
            completed,
            bytes_received,
            rate,
            average_segment_size,
            estimated_total_size: (completed > 0)
                .then(|| average_segment_size.saturating_mul(total as u64)),
            average_request_time,
        }
    }
}

impl ProgressHook for ThroughputEstimator {
    fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.started.lock().get_or_insert_with(Instant::now);
    }

    fn on_unit_complete(&self, bytes_received: u64, elapsed: Duration) {
        self.bytes.fetch_add(bytes_received, Ordering::Relaxed);
        self.request_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_unit_attempted(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_before_anything_arrives() {
        let estimator = ThroughputEstimator::new();
        estimator.set_total(10);
        let snap = estimator.snapshot();
        assert_eq!(snap.total, 10);
        assert_eq!(snap.completed, 0);
        assert_eq!(snap.estimated_total_size, None);
        assert_eq!(snap.average_segment_size, 0);
    }

    #[test]
    fn test_averages_and_estimate() {
        let estimator = ThroughputEstimator::new();
        estimator.set_total(4);
        estimator.on_unit_complete(1000, Duration::from_millis(100));
        estimator.on_unit_complete(3000, Duration::from_millis(300));
        estimator.on_unit_attempted();
        estimator.on_unit_attempted();
        estimator.on_unit_attempted();

        let snap = estimator.snapshot();
        assert_eq!(snap.attempted, 3);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.bytes_received, 4000);
        assert_eq!(snap.average_segment_size, 2000);
        assert_eq!(snap.estimated_total_size, Some(8000));
        assert_eq!(snap.average_request_time, Duration::from_millis(200));
    }

    #[test]
    fn test_concurrent_updates_are_counted() {
        let estimator = Arc::new(ThroughputEstimator::new());
        estimator.set_total(800);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let estimator = estimator.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        estimator.on_unit_complete(10, Duration::from_millis(1));
                        estimator.on_unit_attempted();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = estimator.snapshot();
        assert_eq!(snap.attempted, 800);
        assert_eq!(snap.bytes_received, 8000);
    }
}
