//! Per-LP checkpoint interval controller (spec §4.10).
//!
//! Tracks how many events have run cleanly since the last rollback
//! (`good`) and how many rollbacks have happened since the last recompute
//! (`bad`), and from measured restore/checkpoint costs derives an interval
//! that amortizes restore cost against checkpointing overhead: the fewer
//! events between checkpoints, the cheaper each restore, but the more time
//! spent checkpointing overall, and vice versa.

const MIN_INTERVAL: u32 = 1;
const MAX_INTERVAL: u32 = 128;

/// Hook for a smarter cost model than the built-in square-root rule. A
/// model implementing this can be plugged in via
/// [`AutoCkpt::with_cost_model`]; left unset, `recompute` uses the rule
/// from spec §4.10 directly.
pub trait CostModel: Send {
    fn interval_for(&mut self, restore_cost_ns: f64, ckpt_cost_ns: f64, slack: f64) -> u32;
}

struct SquareRootRule;

impl CostModel for SquareRootRule {
    fn interval_for(&mut self, restore_cost_ns: f64, ckpt_cost_ns: f64, slack: f64) -> u32 {
        if ckpt_cost_ns <= 0.0 {
            return MAX_INTERVAL;
        }
        let raw = (2.0 * restore_cost_ns / ckpt_cost_ns).sqrt() * slack;
        raw.round() as u32
    }
}

pub struct AutoCkpt {
    good: u32,
    bad: u32,
    interval: u32,
    slack: f64,
    restore_cost_ns: f64,
    ckpt_cost_ns: f64,
    model: Box<dyn CostModel>,
}

impl AutoCkpt {
    pub fn new(initial_interval: u32) -> Self {
        AutoCkpt {
            good: 0,
            bad: 0,
            interval: initial_interval.clamp(MIN_INTERVAL, MAX_INTERVAL),
            slack: 1.0,
            restore_cost_ns: 0.0,
            ckpt_cost_ns: 1.0,
            model: Box::new(SquareRootRule),
        }
    }

    pub fn with_cost_model(mut self, model: Box<dyn CostModel>) -> Self {
        self.model = model;
        self
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Called after every event processed cleanly.
    pub fn register_good(&mut self) {
        self.good += 1;
    }

    /// Called on every rollback, with the wall-clock cost of the restore
    /// that triggered it.
    pub fn register_bad(&mut self, restore_cost_ns: f64) {
        self.bad += 1;
        self.restore_cost_ns = ema(self.restore_cost_ns, restore_cost_ns);
    }

    /// `due(lp)`: true once `good` has reached the current interval.
    /// Resets the counter so the next call starts a fresh window.
    pub fn due(&mut self) -> bool {
        if self.good >= self.interval {
            self.good = 0;
            true
        } else {
            false
        }
    }

    /// Record how long the most recent `checkpoint.take` call cost, used
    /// by `recompute` as the denominator of the square-root rule.
    pub fn record_ckpt_cost(&mut self, ckpt_cost_ns: f64) {
        self.ckpt_cost_ns = ema(self.ckpt_cost_ns, ckpt_cost_ns.max(f64::EPSILON));
    }

    /// Invoked once per LP per GVT: recompute `interval` from the rolling
    /// cost estimates, clamped to `[1, 128]`.
    pub fn recompute(&mut self) {
        let computed = self.model.interval_for(self.restore_cost_ns, self.ckpt_cost_ns, self.slack);
        self.interval = computed.clamp(MIN_INTERVAL, MAX_INTERVAL);
        self.bad = 0;
    }
}

fn ema(prev: f64, sample: f64) -> f64 {
    if prev == 0.0 {
        sample
    } else {
        0.8 * prev + 0.2 * sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_starts_clamped() {
        let ckpt = AutoCkpt::new(500);
        assert_eq!(ckpt.interval(), MAX_INTERVAL);
        let ckpt = AutoCkpt::new(0);
        assert_eq!(ckpt.interval(), MIN_INTERVAL);
    }

    #[test]
    fn due_resets_after_firing() {
        let mut ckpt = AutoCkpt::new(2);
        ckpt.register_good();
        assert!(!ckpt.due());
        ckpt.register_good();
        assert!(ckpt.due());
        assert!(!ckpt.due());
    }

    #[test]
    fn frequent_rollbacks_shrink_the_interval() {
        let mut ckpt = AutoCkpt::new(64);
        ckpt.record_ckpt_cost(100.0);
        ckpt.register_bad(50.0);
        ckpt.recompute();
        let after_cheap_restore = ckpt.interval();
        ckpt.register_bad(5000.0);
        ckpt.recompute();
        assert!(ckpt.interval() >= after_cheap_restore);
    }
}
