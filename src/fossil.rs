//! Fossil collection and termination detection (spec §4.8).
//!
//! Fossil collection itself is mostly mechanical once GVT has advanced:
//! [`crate::lp::LpContext::fossil_collect`] does the per-LP truncation and
//! checkpoint pruning. What lives here is the orchestration across every
//! LP plus the termination-detection hook that rides along with it,
//! because both only make sense evaluated together at a GVT boundary.

use crate::lp::LpContext;
use crate::model::Committed;

pub struct FossilReport {
    pub entries_freed: usize,
    pub all_committable: bool,
}

/// Run fossil collection for every LP this thread owns, and fold in
/// termination detection: an LP is committable once `committed` returns
/// true for the state it holds *as of this GVT*, i.e. right after its own
/// fossil collection has run.
pub fn collect_all(lps: &mut [LpContext], gvt: f64, committed: &dyn Committed) -> FossilReport {
    let mut entries_freed = 0;
    let mut all_committable = true;
    for lp in lps.iter_mut() {
        entries_freed += lp.fossil_collect(gvt);
        if !committed.committed(lp.id, lp.state_ptr()) {
            all_committable = false;
        }
    }
    FossilReport { entries_freed, all_committable }
}

/// Whether this thread's worth of LPs is due for a fossil pass: spec ties
/// it to every GVT advance rather than a fixed event count, so this is a
/// simple re-export of the GVT-changed check dispatch.rs already makes.
pub fn needs_run(last_collected_gvt: f64, current_gvt: f64) -> bool {
    current_gvt > last_collected_gvt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct AlwaysDone;
    impl Committed for AlwaysDone {
        fn committed(&self, _lp: crate::message::LpId, _state: Option<std::ptr::NonNull<u8>>) -> bool {
            true
        }
    }

    struct NeverDone;
    impl Committed for NeverDone {
        fn committed(&self, _lp: crate::message::LpId, _state: Option<std::ptr::NonNull<u8>>) -> bool {
            false
        }
    }

    #[test]
    fn collect_all_reports_committable_when_every_lp_is() {
        let mut lps = vec![LpContext::init(0, 0, 12, 4), LpContext::init(1, 0, 12, 4)];
        for lp in &mut lps {
            lp.handle_positive(Message::pack(0, lp.id, 0.0, 1.0, 0, vec![]));
        }
        let report = collect_all(&mut lps, 2.0, &AlwaysDone);
        assert!(report.all_committable);
        assert_eq!(report.entries_freed, 2);
    }

    #[test]
    fn collect_all_reports_not_committable_if_any_lp_is_not() {
        let mut lps = vec![LpContext::init(0, 0, 12, 4)];
        let report = collect_all(&mut lps, 1.0, &NeverDone);
        assert!(!report.all_committable);
    }

    #[test]
    fn needs_run_tracks_gvt_advance() {
        assert!(!needs_run(3.0, 3.0));
        assert!(needs_run(3.0, 3.5));
    }
}
