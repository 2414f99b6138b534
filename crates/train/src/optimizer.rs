//! Optimisers that keep every layer inside its weight-norm budget.
//!
//! Both variants share the same shape: take a gradient step, then project
//! each weight back according to [`ProjectConfig::constraint_for`].
//!
//! ```text
//! adam:  AdamW(θ, g)                                           → project
//! muon:  m ← βm + (1−β)g ;  u ← nesterov ? (1−β)g + βm : m
//!        W ← (1 − lr·wd)W − lr · dualize(u)                    → project
//! ```
//!
//! `dualize` is `√(out/in) · orthogonalize(u)` for linear weights (an update
//! of unit RMS→RMS norm) and row-wise RMS normalisation for embeddings.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use lipschitz_common::{Constraint, ExperimentConfig, OptimizerKind};
use lipschitz_core::spectral::{
    cap_row_rms, dualize_rows, orthogonalize, shape_scale, soft_cap, soft_cap_coupling,
    spectral_normalize,
};
use lipschitz_core::{LayerKind, LayerSpec, Model};

/// Upper bound on the spectral norm `orthogonalize` can produce, padded 5%.
const ORTHO_OVERSHOOT: f64 = 1.14502 * 1.05;
const ADAM_EPS: f64 = 1e-8;

// ── Parameter slots ─────────────────────────────────────────────────────────

/// One weight matrix plus its optimiser state.
struct ParamSlot {
    spec: LayerSpec,
    var: Var,
    constraint: Constraint,
    momentum: Option<Tensor>,
}

enum Update {
    Adam(AdamW),
    Muon { momentum: f64, nesterov: bool },
}

// ── ConstrainedOptimizer ────────────────────────────────────────────────────

pub struct ConstrainedOptimizer {
    kind: OptimizerKind,
    update: Update,
    slots: Vec<ParamSlot>,
    lr: f64,
    wd: f64,
    w_max: f64,
}

/// Build the optimiser `config.optimizer` names over every weight of `model`.
pub fn get_optimizer(
    config: &ExperimentConfig,
    varmap: &VarMap,
    model: &Model,
) -> anyhow::Result<ConstrainedOptimizer> {
    let slots = {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
        model
            .layers()
            .into_iter()
            .map(|spec| {
                let var = vars
                    .get(&spec.var_name())
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no variable named {}", spec.var_name()))?;
                Ok(ParamSlot {
                    constraint: config.project.constraint_for(&spec.name),
                    spec,
                    var,
                    momentum: None,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let update = match config.optimizer {
        OptimizerKind::Adam => Update::Adam(AdamW::new(
            slots.iter().map(|s| s.var.clone()).collect(),
            ParamsAdamW {
                lr: config.lr,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: ADAM_EPS,
                weight_decay: config.wd,
            },
        )?),
        OptimizerKind::Muon => Update::Muon {
            momentum: config.momentum,
            nesterov: config.nesterov,
        },
    };

    tracing::info!(
        optimizer = config.optimizer.as_str(),
        params = slots.len(),
        lr = config.lr,
        wd = config.wd,
        w_max = config.w_max,
        "Optimizer ready"
    );

    Ok(ConstrainedOptimizer {
        kind: config.optimizer,
        update,
        slots,
        lr: config.lr,
        wd: config.wd,
        w_max: config.w_max,
    })
}

impl ConstrainedOptimizer {
    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
        if let Update::Adam(adam) = &mut self.update {
            adam.set_learning_rate(lr);
        }
    }

    /// Apply one update from `grads`, then project every weight.
    pub fn step(&mut self, grads: &GradStore) -> anyhow::Result<()> {
        match &mut self.update {
            Update::Adam(adam) => adam.step(grads)?,
            Update::Muon { momentum, nesterov } => {
                let (beta, nesterov) = (*momentum, *nesterov);
                for slot in &mut self.slots {
                    muon_update(slot, grads, self.lr, self.wd, beta, nesterov)?;
                }
            }
        }
        for slot in &self.slots {
            project(slot, self.lr, self.wd, self.w_max)?;
        }
        Ok(())
    }
}

fn muon_update(
    slot: &mut ParamSlot,
    grads: &GradStore,
    lr: f64,
    wd: f64,
    beta: f64,
    nesterov: bool,
) -> candle_core::Result<()> {
    let Some(g) = grads.get(slot.var.as_tensor()) else {
        return Ok(());
    };
    let g = g.detach();

    let buf = match slot.momentum.take() {
        Some(buf) => ((buf.affine(beta, 0.0)? + g.affine(1.0 - beta, 0.0)?)?),
        None => g.affine(1.0 - beta, 0.0)?,
    };
    let u = if nesterov {
        (g.affine(1.0 - beta, 0.0)? + buf.affine(beta, 0.0)?)?
    } else {
        buf.clone()
    };
    slot.momentum = Some(buf);

    let dual = match slot.spec.kind {
        LayerKind::Linear => orthogonalize(&u)?.affine(shape_scale(&u)?, 0.0)?,
        LayerKind::Embedding => dualize_rows(&u)?,
    };
    let w = slot.var.as_tensor().detach();
    let next = (w.affine(1.0 - lr * wd, 0.0)? - dual.affine(lr, 0.0)?)?;
    slot.var.set(&next)
}

fn project(slot: &ParamSlot, lr: f64, wd: f64, w_max: f64) -> candle_core::Result<()> {
    let w = slot.var.as_tensor().detach();
    let projected = match (slot.spec.kind, slot.constraint) {
        (_, Constraint::None) => return Ok(()),
        (LayerKind::Embedding, _) => cap_row_rms(&w, w_max)?,
        (LayerKind::Linear, Constraint::SpectralNormalize) => spectral_normalize(&w, w_max)?,
        // The cubic cap is approximate: at large lr it can settle a few
        // percent above w_max.
        (LayerKind::Linear, Constraint::SoftCap) => {
            let scale = shape_scale(&w)?;
            let alpha = soft_cap_coupling(w_max, lr * wd, lr * ORTHO_OVERSHOOT);
            soft_cap(&w.affine(1.0 / scale, 0.0)?, alpha)?.affine(scale, 0.0)?
        }
    };
    slot.var.set(&projected)
}

// ── Tests ───────────────────────────────────────────────────────────────────
