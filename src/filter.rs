//! First-order exponential smoothing.

/// Exponential filter `y ← k·x + (1 − k)·y`.
///
/// Tracks the published max-charge-current limit so the ceiling tapers
/// smoothly instead of stepping with every SOC estimate change.
#[derive(Debug, Clone)]
pub struct ExpFilter {
    value: f64,
    k: f64,
}

impl ExpFilter {
    /// Creates a filter seeded at `initial` with smoothing coefficient `k`
    /// in (0, 1]. Higher `k` follows the input faster.
    pub fn new(initial: f64, k: f64) -> Self {
        assert!(k > 0.0 && k <= 1.0, "smoothing coefficient must be in (0, 1]");
        Self { value: initial, k }
    }

    /// Steps the filter toward `target`.
    pub fn update(&mut self, target: f64) {
        self.value = self.k * target + (1.0 - self.k) * self.value;
    }

    /// Current filtered value.
    pub fn value(&self) -> f64 {
        self.value
    }
}
