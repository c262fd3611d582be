//! Batches, loader seams, and the image-folder dataset
//!
//! The engine consumes loaders through the `TrainLoader`/`EvalLoader`
//! traits; `ImageFolderDataset` + `BatchedLoader` provide the concrete
//! market1501-style directory implementation.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;

use crate::preprocess;

/// One training batch, tensors already on the compute device.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    pub images: Tensor,
    /// Contiguous identity labels for the classifier head.
    pub pids: Tensor,
    pub camids: Tensor,
    pub viewids: Tensor,
}

/// One validation batch; raw identity/camera labels ride along on the
/// host for the evaluator, together with the source paths for the
/// visualization side-channel.
#[derive(Debug, Clone)]
pub struct EvalBatch {
    pub images: Tensor,
    pub camids: Tensor,
    pub viewids: Tensor,
    pub pid_labels: Vec<i64>,
    pub cam_labels: Vec<i64>,
    pub paths: Vec<PathBuf>,
}

pub trait TrainLoader {
    fn reset(&mut self) -> anyhow::Result<()>;
    fn next_batch(&mut self) -> Option<anyhow::Result<TrainBatch>>;
    fn num_batches(&self) -> usize;
}

pub trait EvalLoader {
    fn reset(&mut self) -> anyhow::Result<()>;
    fn next_batch(&mut self) -> Option<anyhow::Result<EvalBatch>>;
    /// Number of leading samples that form the query set.
    fn num_query(&self) -> usize;
}

/// One person crop on disk with its parsed labels.
#[derive(Debug, Clone)]
pub struct ReidSample {
    pub path: PathBuf,
    pub pid: i64,
    pub camid: i64,
    pub viewid: i64,
    /// Contiguous training label; equal to `pid` cast down when the
    /// dataset was scanned without relabeling.
    pub label: u32,
}

/// Parse a market1501-style stem: `{pid}_c{camid}...`, e.g. `0002_c1s1_000451_03`.
fn parse_stem(stem: &str) -> Option<(i64, i64)> {
    let mut parts = stem.split('_');
    let pid: i64 = parts.next()?.parse().ok()?;
    let cam_part = parts.next()?.strip_prefix('c')?;
    let digits: String = cam_part.chars().take_while(|c| c.is_ascii_digit()).collect();
    let camid: i64 = digits.parse().ok()?;
    Some((pid, camid))
}

/// A directory of person crops named by identity and camera.
pub struct ImageFolderDataset {
    samples: Vec<ReidSample>,
    num_ids: usize,
}

impl ImageFolderDataset {
    /// Scan a directory of jpg/png crops. Distractor images (pid -1) and
    /// files that do not parse are skipped. With `relabel`, identities
    /// are mapped to contiguous labels for the classifier head.
    pub fn scan(dir: &Path, relabel: bool) -> anyhow::Result<Self> {
        let mut samples = Vec::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("cannot read dataset dir {}: {e}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if !matches!(ext.as_deref(), Some("jpg") | Some("jpeg") | Some("png")) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((pid, camid)) = parse_stem(stem) else {
                continue;
            };
            if pid == -1 {
                continue;
            }
            samples.push(ReidSample {
                path,
                pid,
                camid,
                viewid: 0,
                label: pid as u32,
            });
        }
        samples.sort_by(|a, b| a.path.cmp(&b.path));

        let mut pids: Vec<i64> = samples.iter().map(|s| s.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        if relabel {
            for sample in samples.iter_mut() {
                if let Ok(label) = pids.binary_search(&sample.pid) {
                    sample.label = label as u32;
                }
            }
        }

        Ok(Self {
            samples,
            num_ids: pids.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of distinct identities.
    pub fn num_ids(&self) -> usize {
        self.num_ids
    }

    pub fn samples(&self) -> &[ReidSample] {
        &self.samples
    }
}

/// Batches an `ImageFolderDataset`, shuffling for training and keeping
/// the query-then-gallery order for evaluation.
pub struct BatchedLoader {
    samples: Vec<ReidSample>,
    batch_size: usize,
    shuffle: bool,
    device: Device,
    num_query: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl BatchedLoader {
    pub fn train(dataset: ImageFolderDataset, batch_size: usize, device: Device) -> Self {
        let order = (0..dataset.len()).collect();
        Self {
            samples: dataset.samples,
            batch_size,
            shuffle: true,
            device,
            num_query: 0,
            order,
            cursor: 0,
        }
    }

    /// Query samples first, gallery samples after, never shuffled.
    pub fn eval(
        query: ImageFolderDataset,
        gallery: ImageFolderDataset,
        batch_size: usize,
        device: Device,
    ) -> Self {
        let num_query = query.len();
        let mut samples = query.samples;
        samples.extend(gallery.samples);
        let order = (0..samples.len()).collect();
        Self {
            samples,
            batch_size,
            shuffle: false,
            device,
            num_query,
            order,
            cursor: 0,
        }
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut rand::rng());
        }
    }

    fn next_indices(&mut self) -> Option<Vec<usize>> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        Some(indices)
    }

    fn load_images(&self, indices: &[usize]) -> anyhow::Result<Tensor> {
        let mut images = Vec::with_capacity(indices.len());
        for &idx in indices {
            images.push(preprocess::load_input(&self.samples[idx].path, &self.device)?);
        }
        Ok(Tensor::stack(&images, 0)?)
    }

    fn label_tensor(&self, values: Vec<u32>) -> anyhow::Result<Tensor> {
        let n = values.len();
        Ok(Tensor::from_vec(values, n, &self.device)?)
    }
}

impl TrainLoader for BatchedLoader {
    fn reset(&mut self) -> anyhow::Result<()> {
        self.rewind();
        Ok(())
    }

    fn next_batch(&mut self) -> Option<anyhow::Result<TrainBatch>> {
        let indices = self.next_indices()?;
        let build = || -> anyhow::Result<TrainBatch> {
            let images = self.load_images(&indices)?;
            let pids = indices.iter().map(|&i| self.samples[i].label).collect();
            let camids = indices.iter().map(|&i| self.samples[i].camid as u32).collect();
            let viewids = indices.iter().map(|&i| self.samples[i].viewid as u32).collect();
            Ok(TrainBatch {
                images,
                pids: self.label_tensor(pids)?,
                camids: self.label_tensor(camids)?,
                viewids: self.label_tensor(viewids)?,
            })
        };
        Some(build())
    }

    fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl EvalLoader for BatchedLoader {
    fn reset(&mut self) -> anyhow::Result<()> {
        self.rewind();
        Ok(())
    }

    fn next_batch(&mut self) -> Option<anyhow::Result<EvalBatch>> {
        let indices = self.next_indices()?;
        let build = || -> anyhow::Result<EvalBatch> {
            let images = self.load_images(&indices)?;
            let camids = indices.iter().map(|&i| self.samples[i].camid as u32).collect();
            let viewids = indices.iter().map(|&i| self.samples[i].viewid as u32).collect();
            Ok(EvalBatch {
                images,
                camids: self.label_tensor(camids)?,
                viewids: self.label_tensor(viewids)?,
                pid_labels: indices.iter().map(|&i| self.samples[i].pid).collect(),
                cam_labels: indices.iter().map(|&i| self.samples[i].camid).collect(),
                paths: indices.iter().map(|&i| self.samples[i].path.clone()).collect(),
            })
        };
        Some(build())
    }

    fn num_query(&self) -> usize {
        self.num_query
    }
}

/// In-memory loaders over prebuilt batches, for tests.
#[cfg(test)]
pub mod testutil {
    use super::*;

    pub struct VecTrainLoader {
        batches: Vec<TrainBatch>,
        cursor: usize,
    }

    impl VecTrainLoader {
        pub fn new(batches: Vec<TrainBatch>) -> Self {
            Self { batches, cursor: 0 }
        }
    }

    impl TrainLoader for VecTrainLoader {
        fn reset(&mut self) -> anyhow::Result<()> {
            self.cursor = 0;
            Ok(())
        }

        fn next_batch(&mut self) -> Option<anyhow::Result<TrainBatch>> {
            let batch = self.batches.get(self.cursor)?.clone();
            self.cursor += 1;
            Some(Ok(batch))
        }

        fn num_batches(&self) -> usize {
            self.batches.len()
        }
    }

    pub struct VecEvalLoader {
        batches: Vec<EvalBatch>,
        num_query: usize,
        cursor: usize,
    }

    impl VecEvalLoader {
        pub fn new(batches: Vec<EvalBatch>, num_query: usize) -> Self {
            Self {
                batches,
                num_query,
                cursor: 0,
            }
        }
    }

    impl EvalLoader for VecEvalLoader {
        fn reset(&mut self) -> anyhow::Result<()> {
            self.cursor = 0;
            Ok(())
        }

        fn next_batch(&mut self) -> Option<anyhow::Result<EvalBatch>> {
            let batch = self.batches.get(self.cursor)?.clone();
            self.cursor += 1;
            Some(Ok(batch))
        }

        fn num_query(&self) -> usize {
            self.num_query
        }
    }
}
