//! Progress reporting for ranged downloads.
//!
//! Workers add to a shared [`ProgressMeter`] as bytes land on disk and take
//! them back out when a range is retried. A [`ProgressReporter`] thread polls
//! the meter and forwards the totals to a callback.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Progress callback with byte-level updates.
///
/// # Arguments
///
/// * `bytes_downloaded` - Bytes written across all ranges
/// * `total_bytes` - Content length reported by the HEAD request
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Shared progress counters for one download job.
#[derive(Debug, Default)]
pub struct ProgressMeter {
    total: AtomicU64,
    bytes: AtomicU64,
    rewinds: AtomicUsize,
    rewound_bytes: AtomicU64,
    done: AtomicBool,
}

impl ProgressMeter {
    /// Create a meter for content of `total` bytes.
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            ..Default::default()
        }
    }

    /// Expected size of the content.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Bytes currently counted as downloaded.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Count `n` freshly written bytes.
    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    /// Take back `n` bytes counted by an attempt that is being retried.
    pub fn rewind(&self, n: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(n))
            });
        self.rewinds.fetch_add(1, Ordering::SeqCst);
        self.rewound_bytes.fetch_add(n, Ordering::SeqCst);
    }

    /// Number of times [`rewind`](Self::rewind) has been called.
    pub fn rewinds(&self) -> usize {
        self.rewinds.load(Ordering::SeqCst)
    }

    /// Sum of all rewound byte counts.
    pub fn rewound_bytes(&self) -> u64 {
        self.rewound_bytes.load(Ordering::SeqCst)
    }

    /// Signal that the job has finished.
    pub fn signal_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Check if the job has finished.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Periodic progress reporter.
///
/// Spawns a background thread that polls a [`ProgressMeter`] and invokes a
/// callback. Dropping the reporter stops the thread after one final report.
pub struct ProgressReporter {
    handle: Option<JoinHandle<()>>,
    meter: Arc<ProgressMeter>,
}

impl ProgressReporter {
    /// Start a new progress reporter polling every `poll_interval`.
    pub fn start(
        meter: Arc<ProgressMeter>,
        callback: ProgressCallback,
        poll_interval: Duration,
    ) -> Self {
        let meter_clone = Arc::clone(&meter);

        let handle = thread::spawn(move || {
            while !meter_clone.is_done() {
                callback(meter_clone.bytes(), meter_clone.total());
                thread::sleep(poll_interval);
            }

            // Final report
            callback(meter_clone.bytes(), meter_clone.total());
        });

        Self {
            handle: Some(handle),
            meter,
        }
    }

    /// Start a reporter with default 100ms poll interval.
    pub fn start_default(meter: Arc<ProgressMeter>, callback: ProgressCallback) -> Self {
        Self::start(meter, callback, Duration::from_millis(100))
    }

    /// Stop the reporter and wait for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.meter.signal_done();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_meter_add_and_rewind() {
        let meter = ProgressMeter::new(100);
        meter.add(40);
        meter.add(20);
        assert_eq!(meter.bytes(), 60);

        meter.rewind(20);
        assert_eq!(meter.bytes(), 40);
        assert_eq!(meter.rewinds(), 1);
        assert_eq!(meter.rewound_bytes(), 20);
    }

    #[test]
    fn test_meter_rewind_saturates() {
        let meter = ProgressMeter::new(10);
        meter.add(3);
        meter.rewind(5);
        assert_eq!(meter.bytes(), 0);
    }

    #[test]
    fn test_meter_signal_done() {
        let meter = ProgressMeter::new(1);
        assert!(!meter.is_done());
        meter.signal_done();
        assert!(meter.is_done());
    }

    #[test]
    fn test_reporter_final_report_sees_all_bytes() {
        let meter = Arc::new(ProgressMeter::new(1000));
        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = Arc::clone(&reports);

        let callback: ProgressCallback = Arc::new(move |bytes, total| {
            reports_clone.lock().push((bytes, total));
        });

        let reporter =
            ProgressReporter::start(Arc::clone(&meter), callback, Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        meter.add(1000);
        reporter.stop();

        let reports = reports.lock();
        assert!(!reports.is_empty());
        assert_eq!(reports.last(), Some(&(1000, 1000)));
    }
}
