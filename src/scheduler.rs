//! Epoch-based learning-rate schedule
//!
//! Linear warmup followed by cosine decay. The epoch driver queries the
//! rate at epoch entry and applies it to the primary optimizer; the value
//! is also what the progress log reports as the base learning rate.

use crate::config::SolverConfig;

#[derive(Debug, Clone)]
pub struct WarmupCosineLr {
    base_lr: f64,
    min_lr: f64,
    warmup_epochs: usize,
    max_epochs: usize,
}

impl WarmupCosineLr {
    pub fn new(base_lr: f64, min_lr: f64, warmup_epochs: usize, max_epochs: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_epochs,
            max_epochs,
        }
    }

    pub fn from_solver(solver: &SolverConfig) -> Self {
        Self::new(
            solver.base_lr,
            solver.min_lr,
            solver.warmup_epochs,
            solver.max_epochs,
        )
    }

    /// Learning rate for a 1-based epoch number.
    pub fn lr_for_epoch(&self, epoch: usize) -> f64 {
        if self.warmup_epochs > 0 && epoch <= self.warmup_epochs {
            return self.base_lr * epoch as f64 / self.warmup_epochs as f64;
        }
        let decay_span = self.max_epochs.saturating_sub(self.warmup_epochs);
        if decay_span == 0 {
            return self.base_lr;
        }
        let progress = (epoch - self.warmup_epochs) as f64 / decay_span as f64;
        let progress = progress.min(1.0);
        self.min_lr
            + 0.5 * (self.base_lr - self.min_lr) * (1.0 + (progress * std::f64::consts::PI).cos())
    }
}
