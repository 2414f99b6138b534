//! Learning rate schedule.

use lipschitz_common::{ExperimentConfig, Schedule};

/// Floor of the cooldown blend, as a fraction of the base learning rate.
const COOLDOWN_FLOOR: f64 = 0.1;

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Learning rate schedule: warmup → constant / cosine / linear decay, or
/// stable-then-cooldown.
#[derive(Clone)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    schedule: Schedule,
    cooldown_frac: f64,
}

impl LrScheduler {
    pub fn new(
        lr: f64,
        lr_min: f64,
        warmup_steps: usize,
        max_steps: usize,
        schedule: Schedule,
    ) -> Self {
        Self {
            step: 0,
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            schedule,
            cooldown_frac: 0.0,
        }
    }

    /// Scheduler for a run; decaying schedules bottom out at `0.1 · lr`.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(
            config.lr,
            config.lr * COOLDOWN_FLOOR,
            config.warmup_steps,
            config.steps,
            config.schedule,
        )
        .with_cooldown_frac(config.cooldown_frac)
    }

    /// Fraction of training spent in the cooldown phase of [`Schedule::Cooldown`].
    pub fn with_cooldown_frac(mut self, frac: f64) -> Self {
        self.cooldown_frac = frac;
        self
    }

    /// Current learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step;

        // Warmup phase: linear ramp from 0 to lr.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }

        if self.max_steps == 0 || self.schedule == Schedule::Constant {
            return self.lr;
        }

        if self.schedule == Schedule::Cooldown {
            return self.lr * self.cooldown_multiplier();
        }

        let step = step.min(self.max_steps);
        if step <= self.warmup_steps {
            return self.lr;
        }

        let decay_steps = (self.max_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        match self.schedule {
            Schedule::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            Schedule::Linear => self.lr - (self.lr - self.lr_min) * progress,
            Schedule::Constant | Schedule::Cooldown => self.lr,
        }
    }

    /// `w · 1 + (1 − w) · 0.1` with `w = min(remaining / cooldown_frac, 1)`.
    fn cooldown_multiplier(&self) -> f64 {
        if self.cooldown_frac <= 0.0 {
            return 1.0;
        }
        let remaining = 1.0 - self.step.min(self.max_steps) as f64 / self.max_steps as f64;
        let w = (remaining / self.cooldown_frac).min(1.0);
        w + (1.0 - w) * COOLDOWN_FLOOR
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn advanced(mut sched: LrScheduler, n: usize) -> LrScheduler {
        for _ in 0..n {
            sched.advance();
        }
        sched
    }

    #[test]
    fn lr_warmup() {
        let sched = LrScheduler::new(1e-3, 1e-6, 100, 1000, Schedule::Cosine);
        // Step 0: (0+1)/100 * 1e-3 = 1e-5
        assert!((sched.current_lr() - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn lr_cosine_midpoint() {
        let sched = advanced(LrScheduler::new(1e-3, 0.0, 0, 1000, Schedule::Cosine), 500);
        // Midpoint of cosine: cos(π·0.5) = 0 → lr = 0.5 * 1e-3
        assert!((sched.current_lr() - 5e-4).abs() < 1e-6);
    }

    #[test]
    fn lr_constant() {
        let sched = advanced(LrScheduler::new(1e-3, 1e-6, 0, 1000, Schedule::Constant), 500);
        assert!((sched.current_lr() - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn cooldown_is_flat_then_blends_to_floor() {
        let base = LrScheduler::new(0.1, 0.0, 0, 1000, Schedule::Cooldown).with_cooldown_frac(0.4);
        // Stable phase: remaining = 0.7 ≥ 0.4.
        assert!((advanced(base.clone(), 300).current_lr() - 0.1).abs() < 1e-12);
        // Halfway through cooldown: w = 0.2 / 0.4 = 0.5 → 0.5 + 0.05.
        assert!((advanced(base.clone(), 800).current_lr() - 0.055).abs() < 1e-12);
        // End: w = 0 → 0.1 · lr.
        assert!((advanced(base, 1000).current_lr() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn from_config_uses_cooldown_preset() {
        let config = ExperimentConfig::cifar_mlp();
        let sched = LrScheduler::from_config(&config);
        assert_eq!(sched.step(), 0);
        assert!((sched.current_lr() - config.lr).abs() < 1e-12);
    }
}
