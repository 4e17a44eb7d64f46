//! Statistics sink (out of scope per spec §1, consumed through this trait
//! boundary). The engine calls every hook unconditionally; a model that
//! doesn't care about statistics uses [`NullStats`], whose methods are all
//! no-ops so the dispatch loop's hot path never branches on whether a
//! sink is installed.

use crate::message::LpId;

pub trait StatsSink: Send + Sync {
    fn on_event_processed(&self, lp: LpId, now: f64) {
        let _ = (lp, now);
    }
    fn on_rollback(&self, lp: LpId, rollback_to: f64) {
        let _ = (lp, rollback_to);
    }
    fn on_gvt_advance(&self, gvt: f64) {
        let _ = gvt;
    }
    fn on_termination(&self, wall_clock_secs: f64) {
        let _ = wall_clock_secs;
    }
}

pub struct NullStats;

impl StatsSink for NullStats {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_stats_accepts_every_hook() {
        let sink = NullStats;
        sink.on_event_processed(0, 1.0);
        sink.on_rollback(0, 0.5);
        sink.on_gvt_advance(1.0);
        sink.on_termination(0.01);
    }
}
