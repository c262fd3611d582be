//! Loss scaling for mixed-precision training
//!
//! Reduced-precision backward passes underflow small gradients; the scaler
//! multiplies the loss before backward, divides the gradient snapshot back
//! down before the optimizer step, and skips the step entirely when a
//! non-finite gradient shows up, backing the scale off. After a run of
//! clean steps the scale grows again.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

#[derive(Debug)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    good_steps: usize,
    enabled: bool,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            scale: if enabled { 65536.0 } else { 1.0 },
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            good_steps: 0,
            enabled,
        }
    }

    #[cfg(test)]
    pub fn with_scale(scale: f64) -> Self {
        Self {
            scale,
            ..Self::new(true)
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Multiply the loss before backward.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        loss * self.scale
    }

    /// Divide every populated gradient by the current scale.
    ///
    /// Parameters without a gradient are skipped; the snapshot may not
    /// cover every variable on every step.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[Var]) -> Result<()> {
        if !self.enabled || self.scale == 1.0 {
            return Ok(());
        }
        let inv = 1.0 / self.scale;
        for var in vars {
            let rescaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * inv)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), rescaled);
        }
        Ok(())
    }

    /// True when no populated gradient contains inf/NaN.
    pub fn grads_are_finite(&self, grads: &GradStore, vars: &[Var]) -> Result<bool> {
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sum = grad
                    .to_dtype(candle_core::DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()?;
                if !sum.is_finite() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Adjust the scale after a step attempt.
    pub fn update(&mut self, found_overflow: bool) {
        if !self.enabled {
            return;
        }
        if found_overflow {
            self.scale *= self.backoff_factor;
            self.good_steps = 0;
        } else {
            self.good_steps += 1;
            if self.good_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.good_steps = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_scale_and_unscale_round_trip() {
        let device = Device::Cpu;
        let scaler = GradScaler::with_scale(2.0);
        let w = Var::from_tensor(&Tensor::ones((1,), DType::F32, &device).unwrap()).unwrap();
        let loss = (w.as_tensor() * 4.0).unwrap().sum_all().unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap();
        let mut grads = scaled.backward().unwrap();
        // d(scale * 4w)/dw = 8 before unscaling
        let raw: f32 = grads
            .get(w.as_tensor())
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((raw - 8.0).abs() < 1e-6);
        scaler.unscale(&mut grads, &[w.clone()]).unwrap();
        let unscaled: f32 = grads
            .get(w.as_tensor())
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((unscaled - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_disabled_scaler_is_identity() {
        let device = Device::Cpu;
        let scaler = GradScaler::new(false);
        let loss = Tensor::full(3.0f32, (), &device).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap();
        assert_eq!(scaled.to_scalar::<f32>().unwrap(), 3.0);
    }

    #[test]
    fn test_overflow_backs_off() {
        let mut scaler = GradScaler::with_scale(1024.0);
        scaler.update(true);
        assert!((scaler.scale() - 512.0).abs() < 1e-9);
        scaler.update(false);
        assert!((scaler.scale() - 512.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_grad_is_skipped() {
        let device = Device::Cpu;
        let scaler = GradScaler::with_scale(2.0);
        let used = Var::from_tensor(&Tensor::ones((1,), DType::F32, &device).unwrap()).unwrap();
        let unused = Var::from_tensor(&Tensor::ones((1,), DType::F32, &device).unwrap()).unwrap();
        let loss = (used.as_tensor() * 2.0).unwrap().sum_all().unwrap();
        let mut grads = scaler.scale_loss(&loss).unwrap().backward().unwrap();
        scaler
            .unscale(&mut grads, &[used.clone(), unused.clone()])
            .unwrap();
        assert!(grads.get(unused.as_tensor()).is_none());
        assert!(scaler
            .grads_are_finite(&grads, &[used, unused])
            .unwrap());
    }
}
