use std::time::{Duration, Instant};

/// Default sliding window for speed calculation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default number of retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
///
/// Fed with cumulative byte counts as reported by a transfer backend; the
/// calculator keeps the deltas internally.
pub struct SpeedCalculator {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
    last_total: u64,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
            window_size: window_size.unwrap_or(DEFAULT_WINDOW),
            last_total: 0,
        }
    }

    /// Records the cumulative `sent` byte count at the current instant.
    ///
    /// A count lower than the previous one means the transfer restarted and
    /// resets the window.
    pub fn record(&mut self, sent: u64) {
        if sent < self.last_total {
            self.reset();
        }
        let delta = sent - self.last_total;
        self.last_total = sent;
        self.add_sample(delta, Instant::now());
    }

    fn add_sample(&mut self, bytes: u64, now: Instant) {
        self.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        if let Some(cutoff) = now.checked_sub(self.window_size) {
            self.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let first = &self.samples[0];
        let last = &self.samples[self.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample only marks the window start.
        let total_bytes: u64 = self.samples[1..].iter().map(|s| s.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_total = 0;
    }
}
