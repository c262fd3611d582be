//! Retrieval evaluation: CMC ranks and mAP
//!
//! The evaluator accumulates (feature, identity, camera) rows streamed
//! during a validation pass, then ranks every query against the gallery
//! under the market1501 protocol: gallery entries sharing the query's
//! identity *and* camera are junk and excluded from the ranking.
//!
//! The accumulator is single-use per pass: `compute` drains the bank, so
//! the caller must `reset` (and re-stream) before evaluating again.

use candle_core::{Result, Tensor};

/// Ranking summary produced by one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalSummary {
    /// CMC curve; `cmc[k-1]` is the probability of a hit within top-k.
    pub cmc: Vec<f32>,
    pub map: f32,
}

pub struct R1MapEvaluator {
    num_query: usize,
    max_rank: usize,
    feat_norm: bool,
    feats: Vec<Tensor>,
    pids: Vec<i64>,
    camids: Vec<i64>,
}

impl R1MapEvaluator {
    pub fn new(num_query: usize, max_rank: usize, feat_norm: bool) -> Self {
        Self {
            num_query,
            max_rank,
            feat_norm,
            feats: Vec::new(),
            pids: Vec::new(),
            camids: Vec::new(),
        }
    }

    /// Empty the accumulator before a new pass.
    pub fn reset(&mut self) {
        self.feats.clear();
        self.pids.clear();
        self.camids.clear();
    }

    /// Number of accumulated rows.
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Append one batch of `[batch, dim]` features with their labels.
    pub fn update(&mut self, features: &Tensor, pids: &[i64], camids: &[i64]) -> Result<()> {
        let batch = features.dim(0)?;
        if batch != pids.len() || batch != camids.len() {
            candle_core::bail!(
                "evaluator update size mismatch: {batch} features, {} pids, {} camids",
                pids.len(),
                camids.len()
            );
        }
        self.feats.push(features.detach());
        self.pids.extend_from_slice(pids);
        self.camids.extend_from_slice(camids);
        Ok(())
    }

    /// Rank queries against the gallery and drain the accumulator.
    pub fn compute(&mut self) -> Result<EvalSummary> {
        let feats = std::mem::take(&mut self.feats);
        let pids = std::mem::take(&mut self.pids);
        let camids = std::mem::take(&mut self.camids);

        if pids.is_empty() {
            candle_core::bail!("evaluator bank is empty; reset() and stream features first");
        }
        if pids.len() <= self.num_query {
            candle_core::bail!(
                "evaluator needs a gallery: {} rows accumulated for {} queries",
                pids.len(),
                self.num_query
            );
        }

        let refs: Vec<&Tensor> = feats.iter().collect();
        let mut all = Tensor::cat(&refs, 0)?;
        if self.feat_norm {
            let norms = (all.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-12)?;
            all = all.broadcast_div(&norms)?;
        }

        let total = pids.len();
        let query = all.narrow(0, 0, self.num_query)?;
        let gallery = all.narrow(0, self.num_query, total - self.num_query)?;
        let dist = squared_distances(&query, &gallery)?;
        let dist: Vec<Vec<f32>> = dist.to_vec2()?;

        let q_pids = &pids[..self.num_query];
        let q_camids = &camids[..self.num_query];
        let g_pids = &pids[self.num_query..];
        let g_camids = &camids[self.num_query..];

        let mut cmc = vec![0.0f32; self.max_rank];
        let mut ap_sum = 0.0f32;
        let mut num_valid = 0usize;

        for qi in 0..self.num_query {
            let mut order: Vec<usize> = (0..g_pids.len()).collect();
            order.sort_by(|&a, &b| dist[qi][a].total_cmp(&dist[qi][b]));

            // Junk removal: same identity seen by the same camera.
            let matches: Vec<bool> = order
                .iter()
                .filter(|&&gi| !(g_pids[gi] == q_pids[qi] && g_camids[gi] == q_camids[qi]))
                .map(|&gi| g_pids[gi] == q_pids[qi])
                .collect();

            let total_rel = matches.iter().filter(|&&m| m).count();
            if total_rel == 0 {
                // Query identity absent from the (junk-filtered) gallery.
                continue;
            }
            num_valid += 1;

            if let Some(first_hit) = matches.iter().position(|&m| m) {
                for r in first_hit..self.max_rank {
                    cmc[r] += 1.0;
                }
            }

            let mut hits = 0usize;
            let mut ap = 0.0f32;
            for (k, &hit) in matches.iter().enumerate() {
                if hit {
                    hits += 1;
                    ap += hits as f32 / (k + 1) as f32;
                }
            }
            ap_sum += ap / total_rel as f32;
        }

        if num_valid == 0 {
            candle_core::bail!("no query identity appears in the gallery");
        }

        for value in cmc.iter_mut() {
            *value /= num_valid as f32;
        }

        Ok(EvalSummary {
            cmc,
            map: ap_sum / num_valid as f32,
        })
    }
}

/// Pairwise squared Euclidean distances between `[Q, D]` and `[G, D]`.
fn squared_distances(query: &Tensor, gallery: &Tensor) -> Result<Tensor> {
    let q2 = query.sqr()?.sum_keepdim(1)?;
    let g2 = gallery.sqr()?.sum_keepdim(1)?.t()?;
    let qg = query.matmul(&gallery.t()?)?;
    q2.broadcast_add(&g2)?.sub(&(qg * 2.0)?)
}
