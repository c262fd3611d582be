//! Engine configuration
//!
//! The configuration is deserialized from a JSON file and validated once at
//! startup; invalid cadences or loss settings are fatal before any training
//! state is created.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Configuration errors surfaced at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("solver.{0} must be at least 1")]
    ZeroCadence(&'static str),
    #[error("solver.max_epochs must be at least 1")]
    ZeroEpochs,
    #[error("model.name must not be empty")]
    EmptyModelName,
    #[error("solver.base_lr must be positive, got {0}")]
    BadBaseLr(f64),
    #[error("solver.center_loss_weight must be positive when metric_loss_type includes \"center\", got {0}")]
    BadCenterWeight(f64),
}

/// Optimization schedule and cadence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    pub max_epochs: usize,
    /// Batches between progress log lines.
    #[serde(default = "default_log_period")]
    pub log_period: usize,
    /// Epochs between checkpoint writes.
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period: usize,
    /// Epochs between validation passes.
    #[serde(default = "default_eval_period")]
    pub eval_period: usize,
    #[serde(default = "default_base_lr")]
    pub base_lr: f64,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    /// Learning rate of the auxiliary center-loss optimizer.
    #[serde(default = "default_center_lr")]
    pub center_lr: f64,
    /// Weight of the center-loss term in the composite loss. The center
    /// parameter gradients are rescaled by its inverse before their own
    /// optimizer step, decoupling the center learning rate from this value.
    #[serde(default = "default_center_loss_weight")]
    pub center_loss_weight: f64,
    /// Enable loss scaling for mixed-precision training.
    #[serde(default = "default_amp")]
    pub amp: bool,
}

/// Model identity and seam dimensions.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Checkpoint files are named `{name}_{epoch}.safetensors`.
    pub name: String,
    #[serde(default)]
    pub dist_train: bool,
    /// Checked for the substring "center" to enable the auxiliary branch.
    #[serde(default = "default_metric_loss_type")]
    pub metric_loss_type: String,
    #[serde(default = "default_feat_dim")]
    pub feat_dim: usize,
    #[serde(default = "default_num_cameras")]
    pub num_cameras: usize,
    #[serde(default = "default_num_views")]
    pub num_views: usize,
}

/// Evaluation and visualization settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TestConfig {
    /// L2-normalize features before building the distance matrix.
    #[serde(default = "default_feat_norm")]
    pub feat_norm: bool,
    /// Write per-query attention heatmaps during inference.
    #[serde(default)]
    pub visualize: bool,
    /// Heatmap output directory; defaults to `{output_dir}/heatmaps`.
    #[serde(default)]
    pub vis_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub solver: SolverConfig,
    pub model: ModelConfig,
    pub test: TestConfig,
    pub output_dir: PathBuf,
}

impl EngineConfig {
    /// Load and parse a JSON configuration file.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("cannot open config {}: {e}", path.display()))?;
        let cfg: Self = serde_json::from_reader(file)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    /// Check the settings that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.solver.max_epochs == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if self.solver.log_period == 0 {
            return Err(ConfigError::ZeroCadence("log_period"));
        }
        if self.solver.checkpoint_period == 0 {
            return Err(ConfigError::ZeroCadence("checkpoint_period"));
        }
        if self.solver.eval_period == 0 {
            return Err(ConfigError::ZeroCadence("eval_period"));
        }
        if self.model.name.is_empty() {
            return Err(ConfigError::EmptyModelName);
        }
        if self.solver.base_lr <= 0.0 {
            return Err(ConfigError::BadBaseLr(self.solver.base_lr));
        }
        if self.has_center_loss() && self.solver.center_loss_weight <= 0.0 {
            return Err(ConfigError::BadCenterWeight(self.solver.center_loss_weight));
        }
        Ok(())
    }

    /// Whether the metric loss carries the auxiliary center branch.
    pub fn has_center_loss(&self) -> bool {
        self.model.metric_loss_type.contains("center")
    }

    /// Deterministic checkpoint path for an epoch.
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.safetensors", self.model.name, epoch))
    }

    /// Directory for heatmap artifacts.
    pub fn vis_dir(&self) -> PathBuf {
        self.test
            .vis_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("heatmaps"))
    }
}

fn default_log_period() -> usize {
    50
}

fn default_checkpoint_period() -> usize {
    10
}

fn default_eval_period() -> usize {
    10
}

fn default_base_lr() -> f64 {
    8e-3
}

fn default_min_lr() -> f64 {
    1.6e-5
}

fn default_warmup_epochs() -> usize {
    5
}

fn default_center_lr() -> f64 {
    0.5
}

fn default_center_loss_weight() -> f64 {
    5e-4
}

fn default_amp() -> bool {
    true
}

fn default_metric_loss_type() -> String {
    "softmax".to_string()
}

fn default_feat_dim() -> usize {
    128
}

fn default_num_cameras() -> usize {
    16
}

fn default_num_views() -> usize {
    1
}

fn default_feat_norm() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> EngineConfig {
        serde_json::from_str(
            r#"{
                "solver": { "max_epochs": 120, "log_period": 50, "checkpoint_period": 40, "eval_period": 40 },
                "model": { "name": "reid_base", "metric_loss_type": "softmax_center" },
                "test": { "feat_norm": true },
                "output_dir": "out"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_defaults() {
        let cfg = sample_config();
        assert_eq!(cfg.solver.max_epochs, 120);
        assert_eq!(cfg.solver.warmup_epochs, 5);
        assert!(cfg.solver.amp);
        assert!(!cfg.model.dist_train);
        assert!(cfg.has_center_loss());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_checkpoint_path_is_deterministic() {
        let cfg = sample_config();
        assert_eq!(
            cfg.checkpoint_path(40),
            PathBuf::from("out/reid_base_40.safetensors")
        );
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut cfg = sample_config();
        cfg.solver.eval_period = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroCadence("eval_period"))
        ));
    }

    #[test]
    fn test_center_weight_checked_only_with_center_loss() {
        let mut cfg = sample_config();
        cfg.solver.center_loss_weight = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::BadCenterWeight(_))));
        cfg.model.metric_loss_type = "triplet".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_default_vis_dir_under_output() {
        let cfg = sample_config();
        assert_eq!(cfg.vis_dir(), PathBuf::from("out/heatmaps"));
    }
}
