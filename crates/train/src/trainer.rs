//! Trainer: encapsulates the full training loop.
//!
//! Decouples the compute graph (forward + loss) from the optimisation step
//! (backward, constrained update, weight projection, schedule advance).

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use lipschitz_common::{Batch, DataLoader, ExperimentConfig};
use lipschitz_core::{create_model, Model};

use crate::logger::Logger;
use crate::optimizer::{get_optimizer, ConstrainedOptimizer};
use crate::results::{LayerLog, TrainResults};
use crate::scheduler::LrScheduler;

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub lr: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and schedule.
pub struct Trainer {
    pub model: Model,
    pub varmap: VarMap,
    optimizer: ConstrainedOptimizer,
    lr_scheduler: LrScheduler,
    pub config: ExperimentConfig,
    pub global_step: usize,
    checkpoints: Vec<BTreeMap<String, Tensor>>,
    progress: bool,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model and optimiser from config.
    pub fn new(config: ExperimentConfig, device: Device) -> anyhow::Result<Self> {
        let mut varmap = VarMap::new();
        let model = create_model(&config, &mut varmap, &device)?;
        let optimizer = get_optimizer(&config, &varmap, &model)?;
        Ok(Self::from_parts(config, varmap, model, optimizer))
    }

    /// Wrap a model and optimiser built by the caller.
    pub fn from_parts(
        config: ExperimentConfig,
        varmap: VarMap,
        model: Model,
        optimizer: ConstrainedOptimizer,
    ) -> Self {
        Self {
            model,
            varmap,
            optimizer,
            lr_scheduler: LrScheduler::from_config(&config),
            config,
            global_step: 0,
            checkpoints: Vec::new(),
            progress: false,
        }
    }

    /// Draw an `indicatif` progress bar during [`Trainer::train`].
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Forward, backward, constrained update on one batch.
    pub fn step(&mut self, batch: &Batch) -> anyhow::Result<StepMetrics> {
        let (loss, accuracy) = self.loss_and_accuracy(batch)?;
        let loss_val = loss.to_scalar::<f32>()? as f64;

        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;

        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            accuracy,
            lr,
        })
    }

    /// Mean validation loss and accuracy over `val_iters` batches.
    pub fn evaluate(&self, loader: &mut impl DataLoader) -> anyhow::Result<(f64, f64)> {
        let iters = self.config.val_iters.max(1);
        let mut loss_sum = 0.0f64;
        let mut acc_sum = 0.0f64;
        for _ in 0..iters {
            let batch = loader.val_batch()?;
            let (loss, acc) = self.loss_and_accuracy(&batch)?;
            loss_sum += loss.to_scalar::<f32>()? as f64;
            acc_sum += acc;
        }
        Ok((loss_sum / iters as f64, acc_sum / iters as f64))
    }

    /// Train for `config.steps` steps.
    ///
    /// Every `log_interval` steps the per-layer weight norms are recorded and
    /// a training line is logged; every `val_interval` steps (and after the
    /// final step) the model is validated.
    pub fn train(&mut self, loader: &mut impl DataLoader) -> anyhow::Result<TrainResults> {
        let steps = self.config.steps;
        let log_interval = self.config.log_interval.max(1);
        let val_interval = self.config.val_interval.max(1);
        let checkpoint_every = match self.config.num_checkpoints {
            0 => None,
            n => Some((steps / n).max(1)),
        };

        let mut logger = Logger::new(&self.config);
        let mut layers: BTreeMap<String, LayerLog> = self
            .model
            .layers()
            .into_iter()
            .map(|spec| (spec.name, LayerLog::default()))
            .collect();

        let pb = if self.progress {
            let pb = ProgressBar::new(steps as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                    .progress_chars("=>-"),
            );
            Some(pb)
        } else {
            None
        };

        tracing::info!(
            steps,
            batch_size = self.config.batch_size,
            optimizer = self.config.optimizer.as_str(),
            "Starting training"
        );

        for step in 0..steps {
            let batch = loader.train_batch()?;
            let metrics = self.step(&batch)?;
            let last = step + 1 == steps;

            if step % log_interval == 0 || last {
                for (name, norm) in self.model.weight_norms()? {
                    layers.entry(name).or_default().weight_norm.push(norm);
                }
                logger.log_training(step, metrics.loss, metrics.accuracy);
            }

            if step % val_interval == 0 || last {
                let (val_loss, val_acc) = self.evaluate(loader)?;
                logger.log_validation(step, val_loss, val_acc);
            }

            if let Some(every) = checkpoint_every {
                if (step + 1) % every == 0 && self.checkpoints.len() < self.config.num_checkpoints {
                    self.checkpoints.push(self.model.snapshot()?);
                }
            }

            if let Some(pb) = &pb {
                pb.set_message(format!("loss {:.4} lr {:.2e}", metrics.loss, metrics.lr));
                pb.inc(1);
            }
        }

        if let Some(pb) = pb {
            pb.finish_with_message("done");
        }
        let results = logger.finish(layers);
        tracing::info!(
            total_time = format!("{:.1}s", results.total_time),
            "Training finished"
        );
        Ok(results)
    }

    /// Weight snapshots captured by [`Trainer::train`].
    pub fn checkpoints(&self) -> &[BTreeMap<String, Tensor>] {
        &self.checkpoints
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn loss_and_accuracy(&self, batch: &Batch) -> anyhow::Result<(Tensor, f64)> {
        let logits = self.model.forward(&batch.inputs)?;
        let classes = logits.dim(D::Minus1)?;
        let logits = logits.reshape(((), classes))?;
        let targets = batch.targets.flatten_all()?.to_dtype(DType::U32)?;
        let l = loss::cross_entropy(&logits, &targets)?;
        Ok((l, accuracy(&logits, &targets)?))
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Fraction of rows whose argmax equals the target.
fn accuracy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f64> {
    let hits = logits
        .argmax(D::Minus1)?
        .eq(targets)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(hits as f64)
}

// ── Tests ───────────────────────────────────────────────────────────────────
