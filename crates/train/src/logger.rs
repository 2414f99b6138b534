//! Metric series and progress lines for a single run.

use std::collections::BTreeMap;
use std::time::Instant;

use sysinfo::{get_current_pid, Pid, ProcessesToUpdate, System};

use lipschitz_common::ExperimentConfig;

use crate::results::{LayerLog, TrainResults};

/// Collects loss/accuracy series and prints progress through `tracing`.
pub struct Logger {
    steps: usize,
    /// `1 + val_iters / val_interval`: validation overhead per training step.
    step_weight: f64,
    start: Instant,
    losses: Vec<f64>,
    train_accuracies: Vec<f64>,
    val_losses: Vec<f64>,
    accuracies: Vec<f64>,
    sys: System,
    pid: Option<Pid>,
}

impl Logger {
    pub fn new(config: &ExperimentConfig) -> Self {
        Self {
            steps: config.steps,
            step_weight: 1.0 + config.val_iters as f64 / config.val_interval.max(1) as f64,
            start: Instant::now(),
            losses: Vec::new(),
            train_accuracies: Vec::new(),
            val_losses: Vec::new(),
            accuracies: Vec::new(),
            sys: System::new(),
            pid: get_current_pid().ok(),
        }
    }

    /// Seconds left, extrapolated from elapsed time after `step` steps.
    pub fn eta(&self, step: usize) -> f64 {
        eta_seconds(
            self.start.elapsed().as_secs_f64(),
            step,
            self.steps,
            self.step_weight,
        )
    }

    pub fn log_training(&mut self, step: usize, loss: f64, accuracy: f64) {
        self.losses.push(loss);
        self.train_accuracies.push(accuracy);
        let eta = format_hms(self.eta(step));
        match self.resident_memory_gib() {
            Some(ram) => tracing::info!(
                step,
                steps = self.steps,
                train_loss = format!("{loss:.4}"),
                train_acc = format!("{accuracy:.4}"),
                eta = %eta,
                ram_gib = format!("{ram:.1}"),
                "train"
            ),
            None => tracing::info!(
                step,
                steps = self.steps,
                train_loss = format!("{loss:.4}"),
                train_acc = format!("{accuracy:.4}"),
                eta = %eta,
                "train"
            ),
        }
    }

    pub fn log_validation(&mut self, step: usize, loss: f64, accuracy: f64) {
        self.val_losses.push(loss);
        self.accuracies.push(accuracy);
        tracing::info!(
            step,
            steps = self.steps,
            val_loss = format!("{loss:.4}"),
            val_acc = format!("{accuracy:.4}"),
            "validation"
        );
    }

    /// Resident set size of this process, in GiB.
    fn resident_memory_gib(&mut self) -> Option<f64> {
        let pid = self.pid?;
        self.sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let bytes = self.sys.process(pid)?.memory();
        Some(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }

    /// Close the run and hand back every series.
    pub fn finish(self, layers: BTreeMap<String, LayerLog>) -> TrainResults {
        TrainResults {
            layers,
            losses: self.losses,
            val_losses: self.val_losses,
            accuracies: self.accuracies,
            train_accuracies: self.train_accuracies,
            total_time: self.start.elapsed().as_secs_f64(),
            lipschitz_constant: None,
        }
    }
}

fn eta_seconds(elapsed: f64, step: usize, steps: usize, weight: f64) -> f64 {
    let done = (1 + step) as f64 * weight;
    let remaining = steps.saturating_sub(step) as f64 * weight;
    elapsed * remaining / done
}

/// `HH:MM:SS`; hours keep counting past a day.
fn format_hms(seconds: f64) -> String {
    let d = chrono::Duration::seconds(seconds.max(0.0) as i64);
    format!(
        "{:02}:{:02}:{:02}",
        d.num_hours(),
        d.num_minutes() % 60,
        d.num_seconds() % 60
    )
}
