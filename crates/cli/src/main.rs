use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use candle_nn::VarMap;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lipschitz_common::{
    get_data_loader, Constraint, DataKind, DataLoader, ExperimentConfig, OptimizerKind,
    ProjectConfig, PRESET_NAMES,
};
use lipschitz_core::create_model;
use lipschitz_train::{get_optimizer, load_results, save_results, Trainer};

#[derive(Parser, Debug)]
#[command(name = "lipschitz", about = "Train models under weight-norm constraints")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a preset (optionally overridden by a config file and flags).
    Train(TrainArgs),
    /// Print preset configurations as JSON.
    Presets(PresetsArgs),
    /// Recompute the Lipschitz bound of a saved run.
    Bound(BoundArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Starting configuration: cifar-mlp or shakespeare-gpt.
    #[arg(long, default_value = "cifar-mlp")]
    preset: String,
    /// JSON config file; replaces the preset entirely.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    steps: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    wd: Option<f64>,
    /// adam or muon.
    #[arg(long)]
    optimizer: Option<String>,
    /// Projection for every layer: none, spectral_normalize or soft_cap.
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    w_max: Option<f64>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    no_progress: bool,
}

impl TrainArgs {
    fn resolve(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path)?,
            None => ExperimentConfig::preset(&self.preset)?,
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(wd) = self.wd {
            config.wd = wd;
        }
        if let Some(opt) = &self.optimizer {
            config.optimizer = OptimizerKind::parse(opt)?;
        }
        if let Some(project) = &self.project {
            config.project = ProjectConfig::uniform(Constraint::parse(project)?);
        }
        if let Some(w_max) = self.w_max {
            config.w_max = w_max;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }
}

// ── Presets / Bound ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PresetsArgs {
    /// Print only this preset.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Parser, Debug)]
struct BoundArgs {
    /// Results JSON written by `lipschitz train`.
    #[arg(long)]
    results: PathBuf,
}

// ── Main ───────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Presets(args) => cmd_presets(args),
        Command::Bound(args) => cmd_bound(args),
    }
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut config = args.resolve()?;
    config.validate()?;
    let device = Device::cuda_if_available(0)?;

    let mut loader = get_data_loader(&config, &device)?;
    match config.data {
        DataKind::Cifar => config.num_classes = loader.output_dim(),
        DataKind::Shakespeare => config.vocab_size = loader.output_dim(),
    }
    config.validate()?;

    let mut varmap = VarMap::new();
    let model = create_model(&config, &mut varmap, &device)?;
    let optimizer = get_optimizer(&config, &varmap, &model)?;

    let mut trainer = Trainer::from_parts(config.clone(), varmap, model, optimizer)
        .with_progress(!args.no_progress);
    let results = trainer.train(&mut loader)?;

    let saved = save_results(&config, results, trainer.checkpoints())?;
    println!("Results: {}", saved.results_path.display());
    if let Some(path) = &saved.checkpoint_path {
        println!("Checkpoints: {}", path.display());
    }
    println!("Lipschitz constant: {:.4}", saved.lipschitz_constant);
    Ok(())
}

fn cmd_presets(args: PresetsArgs) -> Result<()> {
    let names: Vec<&str> = match &args.name {
        Some(name) => vec![name.as_str()],
        None => PRESET_NAMES.to_vec(),
    };
    for name in names {
        let config = ExperimentConfig::preset(name)?;
        println!("# {name}");
        println!("{}", serde_json::to_string_pretty(&config)?);
    }
    Ok(())
}

fn cmd_bound(args: BoundArgs) -> Result<()> {
    let record = load_results(&args.results)?;
    let bound = record.lipschitz_constant()?;
    if let Some(stored) = record.results.lipschitz_constant {
        tracing::info!(stored, recomputed = bound, "Lipschitz constant");
    }
    println!("{bound:.6}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_args(argv: &[&str]) -> TrainArgs {
        let cli = Cli::try_parse_from(std::iter::once("lipschitz").chain(argv.iter().copied()))
            .unwrap();
        match cli.command {
            Command::Train(args) => args,
            other => panic!("expected train, got {other:?}"),
        }
    }

    #[test]
    fn preset_without_overrides() {
        let config = train_args(&["train", "--preset", "shakespeare-gpt"])
            .resolve()
            .unwrap();
        assert_eq!(config, ExperimentConfig::shakespeare_gpt());

        let default = train_args(&["train"]).resolve().unwrap();
        assert_eq!(default, ExperimentConfig::cifar_mlp());
    }

    #[test]
    fn every_flag_overrides_the_preset() {
        let config = train_args(&[
            "train",
            "--data-dir",
            "/data/cifar",
            "--steps",
            "17",
            "--lr",
            "0.02",
            "--wd",
            "0.1",
            "--optimizer",
            "adam",
            "--project",
            "soft_cap",
            "--w-max",
            "2.5",
            "--output-dir",
            "/tmp/out",
            "--seed",
            "9",
            "--no-progress",
        ])
        .resolve()
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data/cifar"));
        assert_eq!(config.steps, 17);
        assert_eq!(config.lr, 0.02);
        assert_eq!(config.wd, 0.1);
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert_eq!(config.project, ProjectConfig::uniform(Constraint::SoftCap));
        assert_eq!(config.w_max, 2.5);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.seed, 9);
    }

    #[test]
    fn config_file_replaces_preset_and_flags_still_apply() {
        let dir = std::env::temp_dir().join(format!("lipschitz-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.json");
        let mut file_config = ExperimentConfig {
            d_embed: 64,
            steps: 5,
            ..ExperimentConfig::shakespeare_gpt()
        };
        file_config
            .project
            .overrides
            .insert("out".to_string(), Constraint::None);
        file_config.save(&path).unwrap();

        let path_arg = path.to_string_lossy().to_string();
        let loaded = train_args(&["train", "--preset", "cifar-mlp", "--config", &path_arg])
            .resolve()
            .unwrap();
        assert_eq!(loaded, file_config);
        assert_eq!(loaded.project.constraint_for("out"), Constraint::None);

        let overridden = train_args(&[
            "train",
            "--config",
            &path_arg,
            "--steps",
            "3",
            "--project",
            "spectral_normalize",
        ])
        .resolve()
        .unwrap();
        assert_eq!(overridden.d_embed, 64);
        assert_eq!(overridden.steps, 3);
        assert!(overridden.project.overrides.is_empty());
        assert_eq!(
            overridden.project.constraint_for("out"),
            Constraint::SpectralNormalize
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(train_args(&["train", "--optimizer", "sgd"]).resolve().is_err());
        assert!(train_args(&["train", "--project", "clip"]).resolve().is_err());
        assert!(train_args(&["train", "--preset", "mnist"]).resolve().is_err());

        let zero_steps = train_args(&["train", "--steps", "0"]).resolve().unwrap();
        assert!(zero_steps.validate().is_err());
    }
}
