//! Engine configuration (spec §6). Fields are plain and public, built
//! incrementally through `SimConfig::new` plus setters rather than a
//! derive-heavy builder, matching the teacher's small `*Config` structs.

use std::sync::Arc;

use crate::model::{Committed, Dispatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LogLevel {
    pub fn to_tracing(self) -> Option<tracing::Level> {
        match self {
            LogLevel::Trace => Some(tracing::Level::TRACE),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Error | LogLevel::Fatal => Some(tracing::Level::ERROR),
            LogLevel::Silent => None,
        }
    }
}

pub struct SimConfig {
    pub lps: usize,
    pub n_threads: usize,
    pub termination_time: Option<f64>,
    pub gvt_period_us: u64,
    pub ckpt_interval: u32,
    pub log_level: LogLevel,
    pub stats_file: Option<String>,
    pub core_binding: bool,
    pub serial: bool,
    pub arena_exp: u32,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub committed: Arc<dyn Committed>,
}

impl SimConfig {
    pub fn new(lps: usize, dispatcher: Arc<dyn Dispatcher>, committed: Arc<dyn Committed>) -> Self {
        SimConfig {
            lps,
            n_threads: 0,
            termination_time: None,
            gvt_period_us: 1_000,
            ckpt_interval: 0,
            log_level: LogLevel::Info,
            stats_file: None,
            core_binding: false,
            serial: false,
            arena_exp: 20, // 1 MiB default per-LP arena
            dispatcher,
            committed,
        }
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_termination_time(mut self, t: f64) -> Self {
        self.termination_time = Some(t);
        self
    }

    pub fn with_gvt_period_us(mut self, us: u64) -> Self {
        self.gvt_period_us = us;
        self
    }

    pub fn with_ckpt_interval(mut self, interval: u32) -> Self {
        self.ckpt_interval = interval;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_stats_file(mut self, path: impl Into<String>) -> Self {
        self.stats_file = Some(path.into());
        self
    }

    pub fn with_core_binding(mut self, enabled: bool) -> Self {
        self.core_binding = enabled;
        self
    }

    pub fn with_arena_exp(mut self, exp: u32) -> Self {
        self.arena_exp = exp;
        self
    }

    pub fn resolved_threads(&self) -> usize {
        if self.n_threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.n_threads
        }
    }

    /// `auto_ckpt` starts in auto mode (interval recomputed from measured
    /// cost) when `ckpt_interval == 0`, fixed otherwise.
    pub fn initial_ckpt_interval(&self) -> u32 {
        if self.ckpt_interval == 0 {
            8
        } else {
            self.ckpt_interval
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::RootsimError> {
        if self.lps == 0 {
            return Err(crate::error::RootsimError::ConfigError("lps must be greater than zero".into()));
        }
        if self.serial {
            return Err(crate::error::RootsimError::ConfigError(
                "serial runtime is out of scope for this engine".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FnCommitted, FnDispatcher};

    fn dummy_config() -> SimConfig {
        SimConfig::new(
            2,
            Arc::new(FnDispatcher(|_, _, _, _, _, _| {})),
            Arc::new(FnCommitted(|_, _| true)),
        )
    }

    #[test]
    fn resolved_threads_falls_back_to_available_parallelism() {
        let cfg = dummy_config();
        assert!(cfg.resolved_threads() >= 1);
        let cfg = dummy_config().with_threads(4);
        assert_eq!(cfg.resolved_threads(), 4);
    }

    #[test]
    fn zero_ckpt_interval_means_auto() {
        let cfg = dummy_config();
        assert_eq!(cfg.initial_ckpt_interval(), 8);
        let cfg = dummy_config().with_ckpt_interval(16);
        assert_eq!(cfg.initial_ckpt_interval(), 16);
    }

    #[test]
    fn validate_rejects_zero_lps() {
        let mut cfg = dummy_config();
        cfg.lps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_serial_mode() {
        let mut cfg = dummy_config();
        cfg.serial = true;
        assert!(cfg.validate().is_err());
    }
}
