//! Experiment configuration.
//!
//! Serialised as JSON and stored alongside every saved run. Every optional
//! field has a `#[serde(default)]` so a trimmed-down JSON still loads; the two
//! notebook presets are available as constructors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ── Enumerations ────────────────────────────────────────────────────────────

/// Which dataset (and therefore which model family) a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// CIFAR-10 image classification, trained with the MLP.
    Cifar,
    /// Character-level Shakespeare, trained with the transformer.
    Shakespeare,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cifar => "cifar",
            Self::Shakespeare => "shakespeare",
        }
    }
}

/// Update rule applied to the raw gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Muon,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Muon => "muon",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "adam" | "adamw" => Ok(Self::Adam),
            "muon" => Ok(Self::Muon),
            other => anyhow::bail!("unknown optimizer {other:?} (expected adam or muon)"),
        }
    }
}

/// Weight projection applied after every optimiser step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Leave weights untouched.
    None,
    /// Rescale so the spectral norm never exceeds `w_max` (power iteration).
    SpectralNormalize,
    /// Polynomial soft cap on the singular values.
    SoftCap,
}

impl Constraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SpectralNormalize => "spectral_normalize",
            Self::SoftCap => "soft_cap",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "spectral_normalize" | "spec_normalize" => Ok(Self::SpectralNormalize),
            "soft_cap" => Ok(Self::SoftCap),
            other => anyhow::bail!(
                "unknown projection {other:?} (expected none, spectral_normalize or soft_cap)"
            ),
        }
    }
}

/// Pointwise nonlinearity used between MLP layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Gelu,
    Tanh,
}

/// Learning-rate schedule after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Constant,
    Cosine,
    Linear,
    /// Stable, then a linear cooldown over the last `cooldown_frac` of training.
    Cooldown,
}

/// Per-layer projection choice: a default plus named overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub default: Constraint,
    #[serde(default)]
    pub overrides: BTreeMap<String, Constraint>,
}

impl ProjectConfig {
    pub fn uniform(constraint: Constraint) -> Self {
        Self {
            default: constraint,
            overrides: BTreeMap::new(),
        }
    }

    /// Constraint for `layer`: its override if one exists, else the default.
    pub fn constraint_for(&self, layer: &str) -> Constraint {
        self.overrides.get(layer).copied().unwrap_or(self.default)
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self::uniform(Constraint::SpectralNormalize)
    }
}

// ── ExperimentConfig ────────────────────────────────────────────────────────

/// Everything needed to reproduce one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    // ── Data ────────────────────────────────────────────────────────────────
    pub data: DataKind,
    /// Directory holding the raw dataset files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // ── Optimisation regime ─────────────────────────────────────────────────
    pub optimizer: OptimizerKind,
    #[serde(default)]
    pub project: ProjectConfig,

    // ── Model ───────────────────────────────────────────────────────────────
    pub d_embed: usize,
    /// Hidden layers for the MLP, decoder blocks for the transformer.
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    /// Filled in from the text loader; ignored for CIFAR.
    #[serde(default)]
    pub vocab_size: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Multiplier on the `1/d_head` attention logits.
    #[serde(default = "default_one")]
    pub softmax_scale: f64,
    /// Norm budget enforced by the projection.
    #[serde(default = "default_one")]
    pub w_max: f64,
    #[serde(default = "default_activation")]
    pub activation: Activation,

    // ── Optimiser hyper-parameters ──────────────────────────────────────────
    pub steps: usize,
    pub batch_size: usize,
    pub lr: f64,
    #[serde(default)]
    pub wd: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_true")]
    pub nesterov: bool,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default = "default_cooldown_frac")]
    pub cooldown_frac: f64,
    #[serde(default = "default_schedule")]
    pub schedule: Schedule,

    // ── Bookkeeping ─────────────────────────────────────────────────────────
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_val_interval")]
    pub val_interval: usize,
    #[serde(default = "default_val_iters")]
    pub val_iters: usize,
    #[serde(default)]
    pub num_checkpoints: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub seed: u64,
    /// Stamped by `save_results`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_num_blocks() -> usize {
    1
}
fn default_num_heads() -> usize {
    4
}
fn default_seq_len() -> usize {
    256
}
fn default_num_classes() -> usize {
    10
}
fn default_one() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_activation() -> Activation {
    Activation::Gelu
}
fn default_momentum() -> f64 {
    0.95
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.95
}
fn default_cooldown_frac() -> f64 {
    0.4
}
fn default_schedule() -> Schedule {
    Schedule::Cooldown
}
fn default_log_interval() -> usize {
    50
}
fn default_val_interval() -> usize {
    100
}
fn default_val_iters() -> usize {
    20
}

// ── Presets ─────────────────────────────────────────────────────────────────

/// Names accepted by [`ExperimentConfig::preset`].
pub const PRESET_NAMES: [&str; 2] = ["cifar-mlp", "shakespeare-gpt"];

impl ExperimentConfig {
    /// MLP on CIFAR-10: three spectrally normalised layers trained with Muon.
    pub fn cifar_mlp() -> Self {
        Self {
            data: DataKind::Cifar,
            data_dir: PathBuf::from("data/cifar-10-batches-bin"),
            optimizer: OptimizerKind::Muon,
            project: ProjectConfig::uniform(Constraint::SpectralNormalize),
            d_embed: 256,
            num_blocks: 1,
            num_heads: default_num_heads(),
            seq_len: default_seq_len(),
            vocab_size: 0,
            num_classes: 10,
            softmax_scale: 1.0,
            w_max: 1.0,
            activation: Activation::Gelu,
            steps: 2000,
            batch_size: 512,
            lr: 0.1,
            wd: 0.0,
            momentum: 0.95,
            nesterov: true,
            beta1: 0.9,
            beta2: 0.95,
            warmup_steps: 0,
            cooldown_frac: 0.4,
            schedule: Schedule::Cooldown,
            log_interval: 50,
            val_interval: 100,
            val_iters: 20,
            num_checkpoints: 0,
            output_dir: default_output_dir(),
            seed: 0,
            timestamp: None,
        }
    }

    /// Small transformer on character-level Shakespeare.
    pub fn shakespeare_gpt() -> Self {
        Self {
            data: DataKind::Shakespeare,
            data_dir: PathBuf::from("data/shakespeare"),
            optimizer: OptimizerKind::Muon,
            project: ProjectConfig::uniform(Constraint::SpectralNormalize),
            d_embed: 128,
            num_blocks: 3,
            num_heads: 4,
            seq_len: 256,
            vocab_size: 65,
            num_classes: 10,
            softmax_scale: 1.0,
            w_max: 1.0,
            activation: Activation::Gelu,
            steps: 2000,
            batch_size: 64,
            lr: 0.1,
            wd: 0.0,
            momentum: 0.95,
            nesterov: true,
            beta1: 0.9,
            beta2: 0.95,
            warmup_steps: 0,
            cooldown_frac: 0.4,
            schedule: Schedule::Cooldown,
            log_interval: 50,
            val_interval: 100,
            val_iters: 20,
            num_checkpoints: 0,
            output_dir: default_output_dir(),
            seed: 0,
            timestamp: None,
        }
    }

    /// Look a preset up by name (see [`PRESET_NAMES`]).
    pub fn preset(name: &str) -> anyhow::Result<Self> {
        match name {
            "cifar-mlp" | "cifar" => Ok(Self::cifar_mlp()),
            "shakespeare-gpt" | "shakespeare" => Ok(Self::shakespeare_gpt()),
            other => anyhow::bail!("unknown preset {other:?}; available: {PRESET_NAMES:?}"),
        }
    }

    /// Head dimension (`d_embed / num_heads`).
    pub fn head_dim(&self) -> usize {
        self.d_embed / self.num_heads.max(1)
    }

    /// Residual mixing weight `1 / (2 · num_blocks)` used by the transformer.
    pub fn residual_alpha(&self) -> f64 {
        1.0 / (2.0 * self.num_blocks.max(1) as f64)
    }

    /// Reject configurations the model or trainer cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.steps > 0, "steps must be > 0");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.d_embed > 0, "d_embed must be > 0");
        anyhow::ensure!(self.w_max > 0.0, "w_max must be > 0 (got {})", self.w_max);
        anyhow::ensure!(self.lr >= 0.0, "lr must be non-negative");
        anyhow::ensure!(self.val_interval > 0, "val_interval must be > 0");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.cooldown_frac),
            "cooldown_frac must lie in [0, 1] (got {})",
            self.cooldown_frac
        );
        match self.data {
            DataKind::Cifar => {
                anyhow::ensure!(self.num_classes > 0, "num_classes must be > 0");
            }
            DataKind::Shakespeare => {
                anyhow::ensure!(self.num_blocks > 0, "num_blocks must be > 0");
                anyhow::ensure!(self.num_heads > 0, "num_heads must be > 0");
                anyhow::ensure!(self.seq_len > 0, "seq_len must be > 0");
                anyhow::ensure!(
                    self.d_embed % self.num_heads == 0,
                    "d_embed ({}) must be divisible by num_heads ({})",
                    self.d_embed,
                    self.num_heads
                );
                anyhow::ensure!(
                    self.head_dim() % 2 == 0,
                    "head dimension ({}) must be even for rotary embeddings",
                    self.head_dim()
                );
            }
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = ExperimentConfig::shakespeare_gpt();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, loaded);
        assert!(!json.contains("timestamp"));
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let json = r#"{
            "data": "cifar",
            "optimizer": "adam",
            "d_embed": 64,
            "steps": 10,
            "batch_size": 8,
            "lr": 0.001
        }"#;
        let loaded: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(loaded.project.default, Constraint::SpectralNormalize);
        assert_eq!(loaded.num_blocks, 1);
        assert_eq!(loaded.w_max, 1.0);
        assert_eq!(loaded.momentum, 0.95);
        assert_eq!(loaded.schedule, Schedule::Cooldown);
        assert_eq!(loaded.output_dir, PathBuf::from("results"));
        loaded.validate().unwrap();
    }

    #[test]
    fn project_overrides_take_precedence() {
        let mut project = ProjectConfig::uniform(Constraint::SoftCap);
        project
            .overrides
            .insert("embed".to_string(), Constraint::None);
        assert_eq!(project.constraint_for("embed"), Constraint::None);
        assert_eq!(project.constraint_for("q0"), Constraint::SoftCap);
    }

    #[test]
    fn presets_are_valid() {
        for name in PRESET_NAMES {
            ExperimentConfig::preset(name).unwrap().validate().unwrap();
        }
        assert!(ExperimentConfig::preset("resnet").is_err());
    }

    #[test]
    fn validate_rejects_bad_head_split() {
        let mut c = ExperimentConfig::shakespeare_gpt();
        c.num_heads = 3;
        assert!(c.validate().is_err());

        // 128 / 64 = 2 is fine, 96 / 32 = 3 is odd and breaks RoPE.
        c.num_heads = 32;
        c.d_embed = 96;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_budget() {
        let mut c = ExperimentConfig::cifar_mlp();
        c.w_max = 0.0;
        assert!(c.validate().is_err());
        c.w_max = 1.0;
        c.cooldown_frac = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn parse_names() {
        assert_eq!(OptimizerKind::parse("muon").unwrap(), OptimizerKind::Muon);
        assert_eq!(
            Constraint::parse("spectral_normalize").unwrap(),
            Constraint::SpectralNormalize
        );
        assert!(Constraint::parse("hard").is_err());
    }

    #[test]
    fn residual_alpha_matches_block_count() {
        let c = ExperimentConfig::shakespeare_gpt();
        assert!((c.residual_alpha() - 1.0 / 6.0).abs() < 1e-12);
    }
}
