//! Sliding-window throughput estimation.
//!
//! [`RateCollector`] answers "how many events per second are happening right
//! now" with bounded memory. Events are counted into a fixed ring of time bins;
//! when an event falls past the end of the window, the oldest bins are zeroed
//! and reused, rolling the window forward.
//!
//! The rate is normalised over the bins actually reached so far (warm-up
//! aware): before the window has filled, dividing by the full window length
//! would understate throughput.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default number of bins in the window.
const DEFAULT_BINS: usize = 30;

/// Default bin width.
const DEFAULT_RESOLUTION: Duration = Duration::from_millis(1000);

/// Ring state. Only touched while holding the collector's lock.
#[derive(Debug)]
struct Window {
    /// Event counters, one per bin
    counts: Vec<u64>,

    /// Start of the oldest bin; `None` until the first event
    anchor: Option<DateTime<Utc>>,

    /// Ring slot that currently represents `anchor`
    oldest_bin: usize,

    /// Window-relative index of the most recently collected event
    last_bin_index: usize,
}

/// Thread-safe events-per-second estimator over a ring of time bins.
///
/// # Example
///
/// ```
/// use fhir_loader::metrics::RateCollector;
///
/// let collector = RateCollector::default();
/// collector.collect(chrono::Utc::now());
/// assert!(collector.events_per_second() >= 0.0);
/// ```
#[derive(Debug)]
pub struct RateCollector {
    window: Mutex<Window>,
    resolution_ms: i64,
    clock: fn() -> DateTime<Utc>,
}

impl Default for RateCollector {
    fn default() -> Self {
        Self::new(DEFAULT_BINS, DEFAULT_RESOLUTION)
    }
}

impl RateCollector {
    /// Create a collector with `bins` bins of width `resolution`.
    ///
    /// Both are clamped to at least 1 (bin, millisecond).
    pub fn new(bins: usize, resolution: Duration) -> Self {
        Self::with_clock(bins, resolution, Utc::now)
    }

    /// Create a collector whose window anchor is taken from `clock`.
    pub fn with_clock(bins: usize, resolution: Duration, clock: fn() -> DateTime<Utc>) -> Self {
        let bins = bins.max(1);
        let resolution_ms = (resolution.as_millis() as i64).max(1);

        Self {
            window: Mutex::new(Window {
                counts: vec![0; bins],
                anchor: None,
                oldest_bin: 0,
                last_bin_index: 0,
            }),
            resolution_ms,
            clock,
        }
    }

    /// Register one event that happened at `event_time`.
    ///
    /// Event times are expected to be non-decreasing. An event earlier than
    /// the window start is counted in the first bin.
    pub fn collect(&self, event_time: DateTime<Utc>) {
        let mut window = self.lock();
        let bins = window.counts.len();

        let mut anchor = *window.anchor.get_or_insert_with(self.clock);
        let offset_ms = (event_time - anchor).num_milliseconds().max(0);
        let mut bin_index = (offset_ms / self.resolution_ms) as usize;

        if bin_index >= bins {
            // Roll the window forward so the event lands in the last bin
            let shift = bin_index - (bins - 1);
            let oldest = window.oldest_bin;
            if shift >= bins {
                window.counts.fill(0);
            } else {
                for i in 0..shift {
                    window.counts[(oldest + i) % bins] = 0;
                }
            }
            window.oldest_bin = (oldest + shift) % bins;
            anchor += chrono::Duration::milliseconds(self.resolution_ms * shift as i64);
            bin_index = bins - 1;
        }

        window.anchor = Some(anchor);
        let slot = (bin_index + window.oldest_bin) % bins;
        window.counts[slot] += 1;
        window.last_bin_index = bin_index;
    }

    /// Current throughput in events per second.
    ///
    /// Returns `0.0` before any event has been collected.
    pub fn events_per_second(&self) -> f64 {
        let window = self.lock();
        if window.anchor.is_none() {
            return 0.0;
        }

        let total: u64 = window.counts.iter().sum();
        let span_secs =
            (self.resolution_ms as f64) * ((window.last_bin_index + 1) as f64) / 1000.0;
        total as f64 / span_secs
    }

    /// Sum of all bin counters currently inside the window.
    pub fn total_in_window(&self) -> u64 {
        self.lock().counts.iter().sum()
    }

    /// Window-relative bin index of the last collected event.
    pub fn last_bin_index(&self) -> usize {
        self.lock().last_bin_index
    }

    /// Start time of the oldest bin, once anchored.
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.lock().anchor
    }

    pub fn bins(&self) -> usize {
        self.lock().counts.len()
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // Window updates never leave the ring half-written, so a poisoned lock is still usable.
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
