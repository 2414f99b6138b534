//! Norm-constrained layers.
//!
//! Both layers store a single bias-free weight under `"{name}.weight"` in the
//! `VarMap`, so the optimiser can look weights up by layer name and project
//! them after every step.
//!
//! Initialisation happens in two phases: the `VarBuilder` allocates a random
//! weight, then [`ConstrainedLinear::initialize`] /
//! [`ConstrainedEmbedding::initialize`] overwrite it with an orthogonal /
//! unit-row-RMS matrix through [`VarMap::set_one`].

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder, VarMap};
use serde::Serialize;

use crate::spectral::{max_row_rms, normalize_rows, orthogonalize, rms_operator_norm, shape_scale};

const LINEAR_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 1.,
};

/// What kind of weight a layer holds; decides update and projection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Linear,
    Embedding,
}

/// Name, kind and shape of one weight-carrying layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    /// Rows of the stored weight (`out` for linear, `vocab` for embedding).
    pub rows: usize,
    /// Columns of the stored weight (`in` for linear, `d_embed` for embedding).
    pub cols: usize,
}

impl LayerSpec {
    pub fn linear(name: impl Into<String>, fan_in: usize, fan_out: usize) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Linear,
            rows: fan_out,
            cols: fan_in,
        }
    }

    pub fn embedding(name: impl Into<String>, vocab: usize, d_embed: usize) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Embedding,
            rows: vocab,
            cols: d_embed,
        }
    }

    /// Key of the weight in the `VarMap`.
    pub fn var_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn num_params(&self) -> usize {
        self.rows * self.cols
    }
}

// ── ConstrainedLinear ───────────────────────────────────────────────────────

/// Bias-free linear layer `y = x Wᵀ` with `W: (out, in)`.
pub struct ConstrainedLinear {
    spec: LayerSpec,
    linear: Linear,
}

impl ConstrainedLinear {
    pub fn new(name: &str, fan_in: usize, fan_out: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb
            .pp(name)
            .get_with_hints((fan_out, fan_in), "weight", LINEAR_INIT)?;
        Ok(Self {
            spec: LayerSpec::linear(name, fan_in, fan_out),
            linear: Linear::new(weight, None),
        })
    }

    /// Overwrite the weight with `orthogonalize(W) · √(out/in)` (norm 1).
    pub fn initialize(&self, varmap: &mut VarMap) -> Result<()> {
        let w = self.weight();
        let init = orthogonalize(w)?.affine(shape_scale(w)?, 0.0)?;
        varmap.set_one(self.spec.var_name(), &init)
    }

    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }

    /// RMS→RMS operator norm of the current weight.
    pub fn weight_norm(&self) -> Result<f64> {
        rms_operator_norm(self.weight())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.linear.forward(x)
    }
}

// ── ConstrainedEmbedding ────────────────────────────────────────────────────

/// Token embedding whose rows are kept at RMS ≤ `w_max`.
pub struct ConstrainedEmbedding {
    spec: LayerSpec,
    embedding: Embedding,
}

impl ConstrainedEmbedding {
    pub fn new(name: &str, vocab: usize, d_embed: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb
            .pp(name)
            .get_with_hints((vocab, d_embed), "weight", LINEAR_INIT)?;
        Ok(Self {
            spec: LayerSpec::embedding(name, vocab, d_embed),
            embedding: Embedding::new(weight, d_embed),
        })
    }

    /// Overwrite the table so every row has RMS exactly 1.
    pub fn initialize(&self, varmap: &mut VarMap) -> Result<()> {
        let init = normalize_rows(self.weight(), 1.0)?;
        varmap.set_one(self.spec.var_name(), &init)
    }

    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Largest row RMS: the ℓ1→RMS norm of the table.
    pub fn weight_norm(&self) -> Result<f64> {
        max_row_rms(self.weight())
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(ids)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
