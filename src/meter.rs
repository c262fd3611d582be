//! Running metric accumulators
//!
//! This module defines the AverageMeter used to track running loss and
//! accuracy averages over one training epoch.

/// A running mean tracker for a scalar metric.
///
/// Loss updates are weighted by batch size, accuracy updates by 1; the
/// epoch driver resets the meter at the start of every epoch so the
/// average only reflects batches of the current epoch.
#[derive(Debug, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the accumulated sum and count.
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    /// Record `value` with weight `n`.
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    /// Running average; 0.0 when nothing has been recorded yet.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
