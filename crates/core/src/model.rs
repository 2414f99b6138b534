//! The two experiment models.
//!
//! * [`Mlp`] — `flatten → mlp_in → act → mlp_0 … → act → mlp_out` for CIFAR-10.
//! * [`Gpt`] — decoder-only transformer for character-level text. Blocks mix
//!   into the residual stream as `x ← (1 − α)·x + α·block(x)` with
//!   `α = 1 / (2·num_blocks)`, so the stream norm can never blow up.
//!
//! Layer names are part of the saved-results format and feed straight into
//! [`crate::lipschitz`]; [`layer_specs`] is the single source of truth.

use std::collections::BTreeMap;

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use lipschitz_common::data::CIFAR_PIXELS;
use lipschitz_common::{Activation, DataKind, ExperimentConfig};

use crate::bond::{self, Bond, Rope};
use crate::linear::{ConstrainedEmbedding, ConstrainedLinear, LayerSpec};

/// Attention output is scaled by 1/3 (one third per Q, K, V path).
pub const ATTENTION_OUTPUT_SCALE: f64 = 1.0 / 3.0;
/// Hidden width of the transformer MLP relative to `d_embed`.
pub const MLP_EXPANSION: usize = 4;

// ── Layer naming ────────────────────────────────────────────────────────────

/// Weight-carrying layers of the model `config` describes, in forward order.
pub fn layer_specs(config: &ExperimentConfig) -> Vec<LayerSpec> {
    let d = config.d_embed;
    match config.data {
        DataKind::Cifar => {
            let mut specs = vec![LayerSpec::linear("mlp_in", CIFAR_PIXELS, d)];
            for i in 0..config.num_blocks {
                specs.push(LayerSpec::linear(format!("mlp_{i}"), d, d));
            }
            specs.push(LayerSpec::linear("mlp_out", d, config.num_classes));
            specs
        }
        DataKind::Shakespeare => {
            let hidden = MLP_EXPANSION * d;
            let mut specs = vec![LayerSpec::embedding("embed", config.vocab_size, d)];
            for i in 0..config.num_blocks {
                specs.push(LayerSpec::linear(format!("q{i}"), d, d));
                specs.push(LayerSpec::linear(format!("k{i}"), d, d));
                specs.push(LayerSpec::linear(format!("v{i}"), d, d));
                specs.push(LayerSpec::linear(format!("w{i}"), d, d));
                specs.push(LayerSpec::linear(format!("mlp_in{i}"), d, hidden));
                specs.push(LayerSpec::linear(format!("mlp_out{i}"), hidden, d));
            }
            specs.push(LayerSpec::linear("out", d, config.vocab_size));
            specs
        }
    }
}

fn linear_from(spec: &LayerSpec, vb: &VarBuilder) -> Result<ConstrainedLinear> {
    ConstrainedLinear::new(&spec.name, spec.cols, spec.rows, vb.clone())
}

// ── MLP ─────────────────────────────────────────────────────────────────────

pub struct Mlp {
    layers: Vec<ConstrainedLinear>,
    activation: Bond,
}

impl Mlp {
    pub fn new(config: &ExperimentConfig, vb: VarBuilder) -> Result<Self> {
        let layers = layer_specs(config)
            .iter()
            .map(|spec| linear_from(spec, &vb))
            .collect::<Result<Vec<_>>>()?;
        let activation = match config.activation {
            Activation::Relu => Bond::ReLU,
            Activation::Gelu => Bond::GeLU,
            Activation::Tanh => Bond::Tanh,
        };
        Ok(Self { layers, activation })
    }

    /// `(B, 3, 32, 32)` images → `(B, num_classes)` logits.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = Bond::Flatten.forward(x)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i < last {
                x = self.activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

// ── GPT ─────────────────────────────────────────────────────────────────────

struct DecoderBlock {
    q: ConstrainedLinear,
    k: ConstrainedLinear,
    v: ConstrainedLinear,
    w: ConstrainedLinear,
    mlp_in: ConstrainedLinear,
    mlp_out: ConstrainedLinear,
}

impl DecoderBlock {
    fn attention(&self, x: &Tensor, num_heads: usize, rope: &Rope, softmax_scale: f64) -> Result<Tensor> {
        let q = bond::split_heads(&self.q.forward(x)?, num_heads)?;
        let k = bond::split_heads(&self.k.forward(x)?, num_heads)?;
        let v = bond::split_heads(&self.v.forward(x)?, num_heads)?;
        let (q, k) = rope.forward(&q, &k)?;

        let scores = bond::attention_qk(&q, &k)?.affine(softmax_scale, 0.0)?;
        let scores = Bond::CausalMask.forward(&scores)?;
        let probs = Bond::Softmax.forward(&scores)?;
        let y = bond::apply_attention_scores(&v, &probs)?;
        let y = Bond::MergeHeads.forward(&y)?;
        self.w.forward(&y)?.affine(ATTENTION_OUTPUT_SCALE, 0.0)
    }

    fn mlp(&self, x: &Tensor) -> Result<Tensor> {
        let h = Bond::GeLU.forward(&self.mlp_in.forward(x)?)?;
        self.mlp_out.forward(&h)
    }
}

/// Mix a block output into the residual stream.
fn residual(x: &Tensor, block_out: &Tensor, alpha: f64) -> Result<Tensor> {
    x.affine(1.0 - alpha, 0.0)? + block_out.affine(alpha, 0.0)?
}

pub struct Gpt {
    embed: ConstrainedEmbedding,
    blocks: Vec<DecoderBlock>,
    out: ConstrainedLinear,
    rope: Rope,
    num_heads: usize,
    softmax_scale: f64,
    alpha: f64,
}

impl Gpt {
    pub fn new(config: &ExperimentConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_embed;
        let hidden = MLP_EXPANSION * d;
        let embed = ConstrainedEmbedding::new("embed", config.vocab_size, d, vb.clone())?;

        let mut blocks = Vec::with_capacity(config.num_blocks);
        for i in 0..config.num_blocks {
            blocks.push(DecoderBlock {
                q: ConstrainedLinear::new(&format!("q{i}"), d, d, vb.clone())?,
                k: ConstrainedLinear::new(&format!("k{i}"), d, d, vb.clone())?,
                v: ConstrainedLinear::new(&format!("v{i}"), d, d, vb.clone())?,
                w: ConstrainedLinear::new(&format!("w{i}"), d, d, vb.clone())?,
                mlp_in: ConstrainedLinear::new(&format!("mlp_in{i}"), d, hidden, vb.clone())?,
                mlp_out: ConstrainedLinear::new(&format!("mlp_out{i}"), hidden, d, vb.clone())?,
            });
        }
        let out = ConstrainedLinear::new("out", d, config.vocab_size, vb)?;

        Ok(Self {
            embed,
            blocks,
            out,
            rope: Rope::new(config.head_dim()),
            num_heads: config.num_heads,
            softmax_scale: config.softmax_scale,
            alpha: config.residual_alpha(),
        })
    }

    /// `(B, T)` token ids → `(B, T, vocab)` logits.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let mut x = self.embed.forward(ids)?;
        for block in &self.blocks {
            let att = block.attention(&x, self.num_heads, &self.rope, self.softmax_scale)?;
            x = residual(&x, &att, self.alpha)?;
            let mlp = block.mlp(&x)?;
            x = residual(&x, &mlp, self.alpha)?;
        }
        self.out.forward(&x)
    }

    fn linears(&self) -> impl Iterator<Item = &ConstrainedLinear> {
        self.blocks
            .iter()
            .flat_map(|b| [&b.q, &b.k, &b.v, &b.w, &b.mlp_in, &b.mlp_out])
            .chain(std::iter::once(&self.out))
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Either experiment model.
pub enum Model {
    Mlp(Mlp),
    Gpt(Gpt),
}

impl Model {
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mlp(m) => m.forward(inputs),
            Self::Gpt(m) => m.forward(inputs),
        }
    }

    /// Layer specs in forward order.
    pub fn layers(&self) -> Vec<LayerSpec> {
        match self {
            Self::Mlp(m) => m.layers.iter().map(|l| l.spec().clone()).collect(),
            Self::Gpt(m) => std::iter::once(m.embed.spec().clone())
                .chain(m.linears().map(|l| l.spec().clone()))
                .collect(),
        }
    }

    /// Current weight norm of every layer, keyed by layer name.
    pub fn weight_norms(&self) -> Result<BTreeMap<String, f64>> {
        let mut out = BTreeMap::new();
        match self {
            Self::Mlp(m) => {
                for l in &m.layers {
                    out.insert(l.spec().name.clone(), l.weight_norm()?);
                }
            }
            Self::Gpt(m) => {
                out.insert(m.embed.spec().name.clone(), m.embed.weight_norm()?);
                for l in m.linears() {
                    out.insert(l.spec().name.clone(), l.weight_norm()?);
                }
            }
        }
        Ok(out)
    }

    /// Detached copies of every weight, keyed by layer name.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut out = BTreeMap::new();
        match self {
            Self::Mlp(m) => {
                for l in &m.layers {
                    out.insert(l.spec().name.clone(), l.weight().detach().copy()?);
                }
            }
            Self::Gpt(m) => {
                out.insert(m.embed.spec().name.clone(), m.embed.weight().detach().copy()?);
                for l in m.linears() {
                    out.insert(l.spec().name.clone(), l.weight().detach().copy()?);
                }
            }
        }
        Ok(out)
    }

    fn initialize(&self, varmap: &mut VarMap) -> Result<()> {
        match self {
            Self::Mlp(m) => {
                for l in &m.layers {
                    l.initialize(varmap)?;
                }
            }
            Self::Gpt(m) => {
                m.embed.initialize(varmap)?;
                for l in m.linears() {
                    l.initialize(varmap)?;
                }
            }
        }
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.layers().iter().map(LayerSpec::num_params).sum()
    }
}

/// Build the model `config.data` calls for, registering its weights in
/// `varmap` and giving every layer unit norm.
pub fn create_model(
    config: &ExperimentConfig,
    varmap: &mut VarMap,
    device: &Device,
) -> anyhow::Result<Model> {
    config.validate()?;
    if config.data == DataKind::Shakespeare {
        anyhow::ensure!(
            config.vocab_size > 0,
            "vocab_size is 0; copy the loader's output_dim into the config first"
        );
    }
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let model = match config.data {
        DataKind::Cifar => Model::Mlp(Mlp::new(config, vb).context("build MLP")?),
        DataKind::Shakespeare => Model::Gpt(Gpt::new(config, vb).context("build transformer")?),
    };
    model.initialize(varmap).context("initialise weights")?;
    tracing::info!(
        data = config.data.as_str(),
        layers = model.layers().len(),
        params = model.num_params(),
        "Model created"
    );
    Ok(model)
}

// ── Tests ───────────────────────────────────────────────────────────────────
