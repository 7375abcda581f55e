use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared request/error counters for one fuzzing run.
///
/// Workers bump `inc`/`inc_error`; a sampler task calls `sample` once per
/// second to maintain a rolling requests-per-second average. Reads are
/// best-effort and may race with writers.
#[derive(Debug, Default)]
pub struct Counter {
    total: AtomicU64,
    prev: AtomicU64,
    errors: AtomicU64,
    samples: Mutex<Vec<u64>>,
}

const SAMPLE_WINDOW: usize = 3;

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One completed request chain.
    pub fn inc(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// One chain that exhausted its retries.
    pub fn inc_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Zeroes the progress total between recursion iterations. Error counts
    /// and the rate window carry over.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
    }

    /// Records the delta since the previous sample into the rolling window.
    pub fn sample(&self) {
        let total = self.total.load(Ordering::Relaxed);
        let prev = self.prev.swap(total, Ordering::Relaxed);
        let mut samples = self.samples.lock().unwrap();
        samples.push(total.saturating_sub(prev));
        if samples.len() > SAMPLE_WINDOW {
            samples.remove(0);
        }
    }

    /// Average requests per second over the sample window. Before the first
    /// sample this is just the running total.
    pub fn rate(&self) -> u64 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return self.total();
        }
        samples.iter().sum::<u64>() / samples.len() as u64
    }
}
