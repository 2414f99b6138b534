//! # lipschitz-train — the training engine
//!
//! Optimisation, scheduling, and bookkeeping for constrained runs:
//!
//! * **[`get_optimizer`]** — Adam or Muon, each followed by a per-layer
//!   weight projection (spectral normalise, soft cap, or none).
//! * **[`LrScheduler`]** — warmup → constant / cosine / linear / cooldown.
//! * **[`Trainer`]** — one call to [`Trainer::step`] runs forward, backward,
//!   the constrained update, and schedule advancement; [`Trainer::train`]
//!   drives a whole run.
//! * **[`Logger`]** and **[`save_results`]** — metric series, ETA lines, and
//!   the results JSON / safetensors checkpoints.

pub mod logger;
pub mod optimizer;
pub mod results;
pub mod scheduler;
pub mod trainer;

pub use logger::Logger;
pub use optimizer::{get_optimizer, ConstrainedOptimizer};
pub use results::{load_results, save_results, LayerLog, RunRecord, SavedRun, TrainResults};
pub use scheduler::LrScheduler;
pub use trainer::{StepMetrics, Trainer};
