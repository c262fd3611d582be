//! Composite training loss
//!
//! Label-smoothed cross entropy over every score head, plus an optional
//! center-loss term that pulls same-identity features toward a learned
//! class center. The center parameters live behind their own optimizer;
//! `center_vars` exposes them so the optimization step can rescale their
//! gradients by the inverse loss weight.

use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::ops;

pub trait ReidLoss {
    fn forward(
        &self,
        scores: &[Tensor],
        features: &Tensor,
        pids: &Tensor,
        camids: &Tensor,
    ) -> Result<Tensor>;

    /// Parameters of the auxiliary loss branch; empty when disabled.
    fn center_vars(&self) -> Vec<Var>;
}

/// Cross entropy with label smoothing.
pub fn label_smooth_cross_entropy(logits: &Tensor, targets: &Tensor, epsilon: f64) -> Result<Tensor> {
    let batch = logits.dim(0)?;
    let num_classes = logits.dim(D::Minus1)?;
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let smooth = log_probs
        .sum(D::Minus1)?
        .neg()?
        .affine(epsilon / num_classes as f64, 0.0)?;
    nll.affine(1.0 - epsilon, 0.0)?
        .add(&smooth)?
        .sum_all()?
        .affine(1.0 / batch as f64, 0.0)
}

/// Learned per-identity feature centers.
pub struct CenterLoss {
    centers: Var,
}

impl CenterLoss {
    pub fn new(num_classes: usize, feat_dim: usize, device: &candle_core::Device) -> Result<Self> {
        let init = Tensor::randn(0.0f32, 1.0, (num_classes, feat_dim), device)?;
        Ok(Self {
            centers: Var::from_tensor(&init)?,
        })
    }

    /// Half the mean squared distance of each feature to its class center.
    pub fn forward(&self, features: &Tensor, pids: &Tensor) -> Result<Tensor> {
        let pids = pids.to_dtype(DType::U32)?;
        let selected = self.centers.as_tensor().index_select(&pids, 0)?;
        features
            .sub(&selected)?
            .sqr()?
            .sum(D::Minus1)?
            .mean_all()?
            .affine(0.5, 0.0)
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.centers.clone()]
    }
}

pub struct CompositeLoss {
    label_smooth_eps: f64,
    center: Option<CenterLoss>,
    center_weight: f64,
}

impl CompositeLoss {
    pub fn new(label_smooth_eps: f64, center: Option<CenterLoss>, center_weight: f64) -> Self {
        Self {
            label_smooth_eps,
            center,
            center_weight,
        }
    }
}

impl ReidLoss for CompositeLoss {
    fn forward(
        &self,
        scores: &[Tensor],
        features: &Tensor,
        pids: &Tensor,
        _camids: &Tensor,
    ) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for head in scores {
            let id_loss = label_smooth_cross_entropy(head, pids, self.label_smooth_eps)?;
            total = Some(match total {
                Some(acc) => acc.add(&id_loss)?,
                None => id_loss,
            });
        }
        let mut total = total.ok_or_else(|| {
            candle_core::Error::Msg("loss requires at least one score head".to_string())
        })?;
        if scores.len() > 1 {
            total = total.affine(1.0 / scores.len() as f64, 0.0)?;
        }
        if let Some(center) = &self.center {
            let center_term = center.forward(features, pids)?;
            total = total.add(&center_term.affine(self.center_weight, 0.0)?)?;
        }
        Ok(total)
    }

    fn center_vars(&self) -> Vec<Var> {
        self.center.as_ref().map(|c| c.vars()).unwrap_or_default()
    }
}
