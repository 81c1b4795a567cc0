//! Fixed-capacity rolling window over current samples.
//!
//! Used to smooth the measured pack current before it feeds the charge
//! profile: the bulk-stage target voltage and the tail-current taper both
//! work on the windowed average rather than the instantaneous reading.

use std::collections::VecDeque;

/// A fixed-capacity FIFO sample window that evicts the oldest sample when
/// full.
///
/// The window reports its arithmetic mean via [`average`](Self::average);
/// an empty window averages to 0.0 so callers never divide by zero.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Creates a new buffer with the specified capacity.
    ///
    /// # Panics
    /// Panics if capacity is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "HistoryBuffer capacity must be greater than 0");
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Pushes a sample, dropping the oldest one first if the buffer is
    /// already at capacity.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Arithmetic mean of the stored samples, 0.0 if the buffer is empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// True once `capacity` samples have been seen.
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Number of samples currently stored.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no samples have been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples the window holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
