//! Epoch driver
//!
//! Runs the training loop over a fixed number of epochs: per-batch
//! optimization steps with running loss/accuracy meters, periodic progress
//! lines, per-epoch throughput reporting, and cadence-gated checkpointing
//! and validation. Checkpoints and validation logging belong to the
//! coordinator role only; workers compute but stay silent.

use std::time::Instant;

use anyhow::Context;
use candle_core::Device;
use candle_nn::{Optimizer, VarMap};

use crate::config::EngineConfig;
use crate::data::{EvalLoader, TrainLoader};
use crate::logging::{CancelToken, Role, TrainLog};
use crate::loss::ReidLoss;
use crate::meter::AverageMeter;
use crate::metrics::R1MapEvaluator;
use crate::model::ReidModel;
use crate::scheduler::WarmupCosineLr;
use crate::step::OptimizationStep;

pub struct TrainEngine<'a> {
    cfg: &'a EngineConfig,
    role: Role,
    log: &'a dyn TrainLog,
    cancel: CancelToken,
}

impl<'a> TrainEngine<'a> {
    pub fn new(cfg: &'a EngineConfig, role: Role, log: &'a dyn TrainLog, cancel: CancelToken) -> Self {
        Self {
            cfg,
            role,
            log,
            cancel,
        }
    }

    /// Run the full training schedule.
    ///
    /// `varmap` holds the model parameters updated by `optimizer` and is
    /// the unit of checkpointing; the center parameters live inside
    /// `loss_fn` and are updated by `optimizer_center`.
    #[allow(clippy::too_many_arguments)]
    pub fn run<O1, O2>(
        &self,
        model: &dyn ReidModel,
        loss_fn: &dyn ReidLoss,
        train_loader: &mut dyn TrainLoader,
        val_loader: &mut dyn EvalLoader,
        optimizer: &mut O1,
        optimizer_center: &mut O2,
        scheduler: &WarmupCosineLr,
        evaluator: &mut R1MapEvaluator,
        varmap: &VarMap,
        device: &Device,
    ) -> anyhow::Result<()>
    where
        O1: Optimizer,
        O2: Optimizer,
    {
        let solver = &self.cfg.solver;
        let mut trainable = varmap.all_vars();
        trainable.extend(loss_fn.center_vars());
        let mut step = OptimizationStep::new(
            trainable,
            solver.amp,
            solver.center_loss_weight,
            self.cfg.has_center_loss(),
        );

        let mut loss_meter = AverageMeter::new();
        let mut acc_meter = AverageMeter::new();
        self.log.info("start training");

        for epoch in 1..=solver.max_epochs {
            if self.cancel.is_cancelled() {
                self.log.info(&format!("training cancelled before epoch {epoch}"));
                break;
            }

            let started = Instant::now();
            loss_meter.reset();
            acc_meter.reset();
            evaluator.reset();

            let lr = scheduler.lr_for_epoch(epoch);
            optimizer.set_learning_rate(lr);

            train_loader.reset()?;
            let total = train_loader.num_batches();
            let mut iteration = 0usize;
            let mut samples = 0usize;

            while let Some(batch) = train_loader.next_batch() {
                if self.cancel.is_cancelled() {
                    break;
                }
                iteration += 1;
                let batch = batch
                    .with_context(|| format!("loading batch {iteration} of epoch {epoch}"))?;
                let batch_size = batch.images.dim(0)?;
                let out = step
                    .run(model, loss_fn, optimizer, optimizer_center, &batch, device)
                    .with_context(|| format!("optimization step {iteration} of epoch {epoch}"))?;

                samples += batch_size;
                loss_meter.update(out.loss as f64, batch_size);
                acc_meter.update(out.acc as f64, 1);

                if iteration % solver.log_period == 0 {
                    self.log.info(&format!(
                        "Epoch[{epoch}] Iteration[{iteration}/{total}] Loss: {:.3}, Acc: {:.3}, Base Lr: {:.2e}",
                        loss_meter.avg(),
                        acc_meter.avg(),
                        lr
                    ));
                }
            }

            if self.cancel.is_cancelled() {
                self.log.info(&format!("training cancelled during epoch {epoch}"));
                break;
            }

            // Per-process wall-clock throughput is misleading when several
            // workers share the epoch, so distributed runs skip the line.
            if !self.cfg.model.dist_train && iteration > 0 {
                let elapsed = started.elapsed().as_secs_f64();
                self.log.info(&format!(
                    "Epoch {epoch} done. Time per batch: {:.3}[s] Speed: {:.1}[samples/s]",
                    elapsed / iteration as f64,
                    samples as f64 / elapsed.max(1e-9)
                ));
            }

            if epoch % solver.checkpoint_period == 0 && self.role.is_coordinator() {
                std::fs::create_dir_all(&self.cfg.output_dir).with_context(|| {
                    format!("creating output dir {}", self.cfg.output_dir.display())
                })?;
                let path = self.cfg.checkpoint_path(epoch);
                varmap
                    .save(&path)
                    .with_context(|| format!("saving checkpoint {}", path.display()))?;
            }

            if epoch % solver.eval_period == 0 && self.role.is_coordinator() {
                self.validate(epoch, model, val_loader, evaluator, device)?;
            }
        }

        Ok(())
    }

    /// One validation pass: stream the loader into the evaluator, rank,
    /// log the summary, then let the device settle before training resumes.
    fn validate(
        &self,
        epoch: usize,
        model: &dyn ReidModel,
        val_loader: &mut dyn EvalLoader,
        evaluator: &mut R1MapEvaluator,
        device: &Device,
    ) -> anyhow::Result<()> {
        val_loader.reset()?;
        let mut batch_idx = 0usize;
        while let Some(batch) = val_loader.next_batch() {
            batch_idx += 1;
            let batch = batch
                .with_context(|| format!("loading validation batch {batch_idx} of epoch {epoch}"))?;
            let features = model.forward(&batch.images, &batch.camids, &batch.viewids)?;
            evaluator.update(&features.detach(), &batch.pid_labels, &batch.cam_labels)?;
        }

        let summary = evaluator.compute()?;
        self.log.info(&format!("Validation Results - Epoch: {epoch}"));
        self.log.info(&format!("mAP: {:.1}%", summary.map * 100.0));
        for rank in [1usize, 5, 10] {
            self.log.info(&format!(
                "CMC curve, Rank-{rank:<3}:{:.1}%",
                summary.cmc[rank - 1] * 100.0
            ));
        }
        device.synchronize()?;
        Ok(())
    }
}
