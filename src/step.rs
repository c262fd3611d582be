//! Single optimization step
//!
//! One forward/backward/update cycle: scaled forward loss, backward,
//! gradient unscale, center-gradient rescale, primary and auxiliary
//! optimizer steps, then a device barrier so the logged loss and timing
//! reflect completed work.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::Optimizer;

use crate::data::TrainBatch;
use crate::loss::ReidLoss;
use crate::model::ReidModel;
use crate::scaler::GradScaler;

/// Scalar outputs of one step, read by the running meters.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f32,
    pub acc: f32,
}

/// Rescale populated center-parameter gradients by `1 / weight`.
///
/// The snapshot may not hold a gradient for every center parameter; a
/// missing gradient is a no-op, not an error, and no tensor is created
/// for it.
pub fn rescale_center_grads(grads: &mut GradStore, vars: &[Var], weight: f64) -> Result<()> {
    let inv = 1.0 / weight;
    for var in vars {
        let rescaled = match grads.get(var.as_tensor()) {
            Some(grad) => (grad * inv)?,
            None => continue,
        };
        grads.insert(var.as_tensor(), rescaled);
    }
    Ok(())
}

/// Fraction of samples whose first score head picks the target identity.
pub fn accuracy(scores: &Tensor, pids: &Tensor) -> Result<f32> {
    let preds = scores.argmax(D::Minus1)?;
    let targets = pids.to_dtype(preds.dtype())?;
    preds
        .eq(&targets)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}

pub struct OptimizationStep {
    scaler: GradScaler,
    trainable: Vec<Var>,
    center_weight: f64,
    use_center: bool,
}

impl OptimizationStep {
    /// `trainable` must cover every parameter either optimizer updates,
    /// including the center parameters.
    pub fn new(trainable: Vec<Var>, amp: bool, center_weight: f64, use_center: bool) -> Self {
        Self {
            scaler: GradScaler::new(amp),
            trainable,
            center_weight,
            use_center,
        }
    }

    pub fn run<O1, O2>(
        &mut self,
        model: &dyn ReidModel,
        loss_fn: &dyn ReidLoss,
        optimizer: &mut O1,
        optimizer_center: &mut O2,
        batch: &TrainBatch,
        device: &Device,
    ) -> Result<StepOutput>
    where
        O1: Optimizer,
        O2: Optimizer,
    {
        let (scores, features) =
            model.forward_train(&batch.images, &batch.pids, &batch.camids, &batch.viewids)?;
        let loss = loss_fn.forward(&scores, &features, &batch.pids, &batch.camids)?;

        let scaled = self.scaler.scale_loss(&loss)?;
        let mut grads = scaled.backward()?;
        self.scaler.unscale(&mut grads, &self.trainable)?;

        let overflow = !self.scaler.grads_are_finite(&grads, &self.trainable)?;
        if !overflow {
            if self.use_center {
                rescale_center_grads(&mut grads, &loss_fn.center_vars(), self.center_weight)?;
            }
            optimizer.step(&grads)?;
            if self.use_center {
                optimizer_center.step(&grads)?;
            }
        }
        self.scaler.update(overflow);

        device.synchronize()?;

        let acc = accuracy(&scores[0], &batch.pids)?;
        Ok(StepOutput {
            loss: loss.to_scalar::<f32>()?,
            acc,
        })
    }
}
