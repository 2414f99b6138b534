//! Upper bound on the Lipschitz constant of a trained model, computed from
//! the final per-layer weight norms.

use std::collections::BTreeMap;

use anyhow::Context;

use lipschitz_common::{DataKind, ExperimentConfig};

use crate::bond::GELU_MAX_DERIVATIVE;
use crate::model::{layer_specs, ATTENTION_OUTPUT_SCALE};

fn norm(norms: &BTreeMap<String, f64>, name: &str) -> anyhow::Result<f64> {
    norms
        .get(name)
        .copied()
        .with_context(|| format!("no weight norm recorded for layer '{name}'"))
}

struct BlockNorms {
    q: f64,
    k: f64,
    v: f64,
    w: f64,
    mlp_in: f64,
    mlp_out: f64,
}

impl BlockNorms {
    fn read(norms: &BTreeMap<String, f64>, i: usize) -> anyhow::Result<Self> {
        Ok(Self {
            q: norm(norms, &format!("q{i}"))?,
            k: norm(norms, &format!("k{i}"))?,
            v: norm(norms, &format!("v{i}"))?,
            w: norm(norms, &format!("w{i}"))?,
            mlp_in: norm(norms, &format!("mlp_in{i}"))?,
            mlp_out: norm(norms, &format!("mlp_out{i}"))?,
        })
    }

    fn mlp_gain(&self) -> f64 {
        self.mlp_out * self.mlp_in / GELU_MAX_DERIVATIVE
    }
}

/// Lipschitz bound for the model `config` describes.
///
/// * MLP: product of all layer norms.
/// * Transformer: first propagates the largest possible activation norm
///   through every residual mix (the embedding emits norm 1), then composes
///   per-block constants, where attention depends on the squared input norm
///   because of the `QKᵀ` product.
pub fn calculate_lipschitz_constant(
    config: &ExperimentConfig,
    norms: &BTreeMap<String, f64>,
) -> anyhow::Result<f64> {
    match config.data {
        DataKind::Cifar => layer_specs(config)
            .iter()
            .try_fold(1.0, |acc, spec| Ok(acc * norm(norms, &spec.name)?)),
        DataKind::Shakespeare => transformer_bound(config, norms),
    }
}

fn transformer_bound(
    config: &ExperimentConfig,
    norms: &BTreeMap<String, f64>,
) -> anyhow::Result<f64> {
    let l_embed = norm(norms, "embed")?;
    let l_out = norm(norms, "out")?;
    let alpha = config.residual_alpha();
    let blocks = (0..config.num_blocks)
        .map(|i| BlockNorms::read(norms, i))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Activation norm entering every sub-block (attention, mlp, attention, …).
    let mut act = Vec::with_capacity(2 * blocks.len() + 1);
    act.push(1.0);
    let mut x = 1.0;
    for b in &blocks {
        let att = ATTENTION_OUTPUT_SCALE * b.w * b.v;
        x = (1.0 - alpha) * x + alpha * att * x;
        act.push(x);
        x = (1.0 - alpha) * x + alpha * b.mlp_gain() * x;
        act.push(x);
    }

    let mut l = l_embed;
    for (i, b) in blocks.iter().enumerate() {
        let a = act[2 * i];
        let l_att = ATTENTION_OUTPUT_SCALE
            * b.w
            * (b.v + 2.0 * b.v * a * a * b.q * b.k)
            * config.softmax_scale;
        l = (1.0 - alpha) * l + alpha * l * l_att;
        l = (1.0 - alpha) * l + alpha * l * b.mlp_gain();
    }
    Ok(l * l_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_norms(config: &ExperimentConfig) -> BTreeMap<String, f64> {
        layer_specs(config)
            .into_iter()
            .map(|s| (s.name, 1.0))
            .collect()
    }

    #[test]
    fn mlp_bound_is_product() {
        let config = ExperimentConfig::cifar_mlp();
        let mut norms = unit_norms(&config);
        norms.insert("mlp_in".into(), 2.0);
        norms.insert("mlp_0".into(), 0.5);
        norms.insert("mlp_out".into(), 3.0);
        let l = calculate_lipschitz_constant(&config, &norms).unwrap();
        assert!((l - 3.0).abs() < 1e-12);
    }

    #[test]
    fn transformer_single_block_by_hand() {
        let config = ExperimentConfig {
            num_blocks: 1,
            softmax_scale: 1.0,
            ..ExperimentConfig::shakespeare_gpt()
        };
        let norms = unit_norms(&config);
        // alpha = 1/2; act[0] = 1; L_att = 1/3 · (1 + 2) = 1
        // after attention: 0.5 + 0.5 = 1; L_mlp = 1/1.1289
        let l_mlp = 1.0 / GELU_MAX_DERIVATIVE;
        let expected = 0.5 + 0.5 * l_mlp;
        let l = calculate_lipschitz_constant(&config, &norms).unwrap();
        assert!((l - expected).abs() < 1e-12, "{l} vs {expected}");
    }

    #[test]
    fn transformer_bound_grows_with_query_norm() {
        let config = ExperimentConfig::shakespeare_gpt();
        let mut norms = unit_norms(&config);
        let base = calculate_lipschitz_constant(&config, &norms).unwrap();
        norms.insert("q0".into(), 2.0);
        let bigger = calculate_lipschitz_constant(&config, &norms).unwrap();
        assert!(bigger > base);
    }

    #[test]
    fn missing_layer_is_named() {
        let config = ExperimentConfig::shakespeare_gpt();
        let mut norms = unit_norms(&config);
        norms.remove("k1");
        let err = calculate_lipschitz_constant(&config, &norms).unwrap_err();
        assert!(err.to_string().contains("k1"));
    }
}
