//! # lipschitz-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`ExperimentConfig`]** — run hyper-parameters (serialised as JSON),
//!   plus the two notebook presets.
//! * **[`DataLoader`]** / **[`get_data_loader`]** — CIFAR-10 and
//!   character-level Shakespeare batch sampling.

pub mod config;
pub mod data;

pub use config::{
    Activation, Constraint, DataKind, ExperimentConfig, OptimizerKind, ProjectConfig, Schedule,
    PRESET_NAMES,
};
pub use data::{
    get_data_loader, AnyDataLoader, Batch, CifarLoader, DataLoader, ShakespeareLoader,
};
