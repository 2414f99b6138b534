//! Run results: the JSON record written after training and the optional
//! safetensors file of weight checkpoints.
//!
//! ```text
//! {
//!   "parameters": { ...ExperimentConfig, "timestamp": "20261019_142501123" },
//!   "results": {
//!     "mlp_in":  { "weight_norm": [1.0, 0.98, ...] },
//!     ...
//!     "losses": [...], "val_losses": [...],
//!     "accuracies": [...], "train_accuracies": [...],
//!     "total_time": 812.4,
//!     "lipschitz_constant": 0.93
//!   }
//! }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use lipschitz_common::ExperimentConfig;
use lipschitz_core::calculate_lipschitz_constant;

/// Weight norm of one layer, sampled every `log_interval` steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerLog {
    pub weight_norm: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainResults {
    #[serde(flatten)]
    pub layers: BTreeMap<String, LayerLog>,
    pub losses: Vec<f64>,
    pub val_losses: Vec<f64>,
    pub accuracies: Vec<f64>,
    pub train_accuracies: Vec<f64>,
    pub total_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lipschitz_constant: Option<f64>,
}

impl TrainResults {
    /// Most recent weight norm of every layer.
    pub fn final_norms(&self) -> BTreeMap<String, f64> {
        self.layers
            .iter()
            .filter_map(|(name, log)| log.weight_norm.last().map(|&n| (name.clone(), n)))
            .collect()
    }
}

/// What goes into the results JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub parameters: ExperimentConfig,
    pub results: TrainResults,
}

impl RunRecord {
    /// Recompute the Lipschitz bound from the stored weight norms.
    pub fn lipschitz_constant(&self) -> anyhow::Result<f64> {
        calculate_lipschitz_constant(&self.parameters, &self.results.final_norms())
    }
}

/// Where a run ended up on disk.
#[derive(Debug, Clone)]
pub struct SavedRun {
    pub results_path: PathBuf,
    pub checkpoint_path: Option<PathBuf>,
    pub lipschitz_constant: f64,
}

// ── Save / load ─────────────────────────────────────────────────────────────

/// Write the results JSON (and checkpoints, if any) into `config.output_dir`.
///
/// The saved config carries a fresh timestamp, and the file name ends in a
/// hash of that config so repeated runs never collide.
pub fn save_results(
    config: &ExperimentConfig,
    results: TrainResults,
    checkpoints: &[BTreeMap<String, Tensor>],
) -> anyhow::Result<SavedRun> {
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("create {}", config.output_dir.display()))?;

    let mut parameters = config.clone();
    parameters.timestamp = Some(chrono::Local::now().format("%Y%m%d_%H%M%S%3f").to_string());

    let mut record = RunRecord {
        parameters,
        results,
    };
    let lipschitz_constant = record.lipschitz_constant()?;
    record.results.lipschitz_constant = Some(lipschitz_constant);

    let results_path = config.output_dir.join(results_file_name(&record.parameters)?);
    let json = serde_json::to_string_pretty(&record)?;
    std::fs::write(&results_path, json)
        .with_context(|| format!("write {}", results_path.display()))?;
    tracing::info!(path = %results_path.display(), lipschitz_constant, "Results saved");

    let checkpoint_path = if checkpoints.is_empty() {
        None
    } else {
        let path = config.output_dir.join(checkpoint_file_name(&record, lipschitz_constant));
        save_checkpoints(&path, checkpoints)?;
        tracing::info!(path = %path.display(), count = checkpoints.len(), "Checkpoints saved");
        Some(path)
    };

    Ok(SavedRun {
        results_path,
        checkpoint_path,
        lipschitz_constant,
    })
}

/// Read a results JSON written by [`save_results`].
pub fn load_results(path: &Path) -> anyhow::Result<RunRecord> {
    let json =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parse results {}", path.display()))
}

fn results_file_name(config: &ExperimentConfig) -> anyhow::Result<String> {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(config)?.hash(&mut hasher);
    Ok(format!(
        "{}_{}_{}_embed{}_lr{:.4}_wd{:.4}_steps{}_{:x}.json",
        config.data.as_str(),
        config.project.default.as_str(),
        config.optimizer.as_str(),
        config.d_embed,
        config.lr,
        config.wd,
        config.steps,
        hasher.finish()
    ))
}

fn checkpoint_file_name(record: &RunRecord, lipschitz_constant: f64) -> String {
    let last = |v: &[f64]| v.last().copied().unwrap_or(f64::NAN);
    format!(
        "{}_{}_val_loss_{:.3}_acc_{:.3}_lipschitz_{:.3}.safetensors",
        record.parameters.data.as_str(),
        record.parameters.optimizer.as_str(),
        last(&record.results.val_losses),
        last(&record.results.accuracies),
        lipschitz_constant
    )
}

/// Flatten checkpoints into `weights_checkpoint_{i}.{layer}` tensors.
fn save_checkpoints(path: &Path, checkpoints: &[BTreeMap<String, Tensor>]) -> anyhow::Result<()> {
    let mut tensors = HashMap::new();
    for (i, weights) in checkpoints.iter().enumerate() {
        for (layer, w) in weights {
            tensors.insert(format!("weights_checkpoint_{i}.{layer}"), w.clone());
        }
    }
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lipschitz-results-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn mlp_results() -> TrainResults {
        let mut layers = BTreeMap::new();
        for (name, n) in [("mlp_in", 1.0), ("mlp_0", 0.5), ("mlp_out", 2.0)] {
            layers.insert(
                name.to_string(),
                LayerLog {
                    weight_norm: vec![1.0, n],
                },
            );
        }
        TrainResults {
            layers,
            losses: vec![2.3, 1.9],
            val_losses: vec![2.0],
            accuracies: vec![0.31],
            train_accuracies: vec![0.1, 0.3],
            total_time: 1.5,
            lipschitz_constant: None,
        }
    }

    #[test]
    fn results_json_layout() {
        let json = serde_json::to_value(mlp_results()).unwrap();
        assert_eq!(json["mlp_0"]["weight_norm"][1], 0.5);
        assert_eq!(json["losses"][0], 2.3);
        assert!(json.get("lipschitz_constant").is_none());
        assert!(json.get("layers").is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = temp_dir("save");
        let config = ExperimentConfig {
            output_dir: dir.clone(),
            ..ExperimentConfig::cifar_mlp()
        };
        let saved = save_results(&config, mlp_results(), &[]).unwrap();
        assert!((saved.lipschitz_constant - 1.0).abs() < 1e-12);
        assert!(saved.checkpoint_path.is_none());

        let name = saved.results_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("cifar_spectral_normalize_muon_embed256_lr0.1000_wd0.0000_steps2000_"));
        assert!(name.ends_with(".json"));

        let record = load_results(&saved.results_path).unwrap();
        assert!(record.parameters.timestamp.is_some());
        assert_eq!(record.results.lipschitz_constant, Some(saved.lipschitz_constant));
        assert_eq!(record.results.layers.len(), 3);
        assert_eq!(record.results.final_norms()["mlp_out"], 2.0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn checkpoints_are_written_as_safetensors() {
        let dir = temp_dir("ckpt");
        let config = ExperimentConfig {
            output_dir: dir.clone(),
            ..ExperimentConfig::cifar_mlp()
        };
        let w = Tensor::ones((2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let mut snapshot = BTreeMap::new();
        snapshot.insert("mlp_in".to_string(), w);
        let saved = save_results(&config, mlp_results(), &[snapshot.clone(), snapshot]).unwrap();

        let path = saved.checkpoint_path.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "cifar_muon_val_loss_2.000_acc_0.310_lipschitz_1.000.safetensors");
        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["weights_checkpoint_1.mlp_in"].dims(), &[2, 3]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_layer_fails_save() {
        let dir = temp_dir("missing");
        let config = ExperimentConfig {
            output_dir: dir.clone(),
            ..ExperimentConfig::cifar_mlp()
        };
        let mut results = mlp_results();
        results.layers.remove("mlp_0");
        assert!(save_results(&config, results, &[]).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
