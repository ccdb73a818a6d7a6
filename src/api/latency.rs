//! In-memory histogram of scan-pipeline latency: dequeue to DONE per job.
//! Workers record, the API reads.

use std::sync::Mutex;
use std::time::Duration;

/// Values stored in milliseconds; tracks 1 ms to 10 minutes, 3 sig figs.
pub struct ScanLatency {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl ScanLatency {
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 600_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(ms.max(1));
        }
    }

    /// (p50_ms, p95_ms, p99_ms), or Nones before the first sample.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    pub fn samples(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for ScanLatency {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_percentiles() {
        let lat = ScanLatency::new();
        assert_eq!(lat.percentiles(), (None, None, None));
    }

    #[test]
    fn records_cluster_around_input() {
        let lat = ScanLatency::new();
        for _ in 0..100 {
            lat.record(Duration::from_millis(250));
        }
        let (p50, _, p99) = lat.percentiles();
        let p50 = p50.unwrap();
        let p99 = p99.unwrap();
        assert!((249..=251).contains(&p50), "p50={p50}");
        assert!((249..=251).contains(&p99), "p99={p99}");
        assert_eq!(lat.samples(), 100);
    }

    #[test]
    fn sub_millisecond_records_clamp_to_one() {
        let lat = ScanLatency::new();
        lat.record(Duration::from_micros(10));
        assert_eq!(lat.samples(), 1);
        assert_eq!(lat.percentiles().0, Some(1));
    }
}
