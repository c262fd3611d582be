//! Model seam for the training engine
//!
//! The engine treats the network as an opaque collaborator behind the
//! `ReidModel` trait: training mode returns score heads plus features,
//! inference mode returns features only. Camera and view labels are part
//! of both signatures because side-information embeddings require them.
//!
//! `PatchEmbedder` is a small concrete implementation (patch convolution,
//! side-information embeddings, linear classifier) so the binary and the
//! end-to-end tests have a real forward/backward path to drive; it is not
//! a re-identification backbone.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{conv2d, embedding, linear, Conv2d, Conv2dConfig, Embedding, Linear, Module,
    VarBuilder};

use crate::config::ModelConfig;

pub trait ReidModel {
    /// Training-mode forward: `(score heads, features)`. The first score
    /// head is the one used for accuracy tracking.
    fn forward_train(
        &self,
        images: &Tensor,
        pids: &Tensor,
        camids: &Tensor,
        viewids: &Tensor,
    ) -> Result<(Vec<Tensor>, Tensor)>;

    /// Inference-mode forward: retrieval features of shape `[batch, feat_dim]`.
    fn forward(&self, images: &Tensor, camids: &Tensor, viewids: &Tensor) -> Result<Tensor>;
}

/// Patch size of the embedder's stem convolution.
const PATCH_SIZE: usize = 16;

pub struct PatchEmbedder {
    patch: Conv2d,
    cam_embed: Embedding,
    view_embed: Embedding,
    head: Linear,
}

impl PatchEmbedder {
    pub fn new(vb: VarBuilder, cfg: &ModelConfig, num_classes: usize) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: PATCH_SIZE,
            ..Default::default()
        };
        let patch = conv2d(3, cfg.feat_dim, PATCH_SIZE, conv_cfg, vb.pp("patch"))?;
        let cam_embed = embedding(cfg.num_cameras, cfg.feat_dim, vb.pp("cam_embed"))?;
        let view_embed = embedding(cfg.num_views, cfg.feat_dim, vb.pp("view_embed"))?;
        let head = linear(cfg.feat_dim, num_classes, vb.pp("head"))?;
        Ok(Self {
            patch,
            cam_embed,
            view_embed,
            head,
        })
    }

    fn features(&self, images: &Tensor, camids: &Tensor, viewids: &Tensor) -> Result<Tensor> {
        // [B, 3, H, W] -> [B, feat_dim, H/16, W/16] -> mean over the patch grid
        let x = self.patch.forward(images)?;
        let x = x.flatten(2, 3)?.mean(D::Minus1)?;
        let cam = self.cam_embed.forward(&camids.to_dtype(DType::U32)?)?;
        let view = self.view_embed.forward(&viewids.to_dtype(DType::U32)?)?;
        x.add(&cam)?.add(&view)
    }
}

impl ReidModel for PatchEmbedder {
    fn forward_train(
        &self,
        images: &Tensor,
        _pids: &Tensor,
        camids: &Tensor,
        viewids: &Tensor,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let feats = self.features(images, camids, viewids)?;
        let scores = self.head.forward(&feats)?;
        Ok((vec![scores], feats))
    }

    fn forward(&self, images: &Tensor, camids: &Tensor, viewids: &Tensor) -> Result<Tensor> {
        self.features(images, camids, viewids)
    }
}
