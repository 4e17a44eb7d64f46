//! Model API (spec §6): the trait boundary between this crate and a
//! user-supplied simulation model. The engine calls into these; the model
//! never reaches back into engine internals except through
//! `ScheduleNewEvent` and the `rs_*` rollback-safe allocator family.

use std::ptr::NonNull;

use crate::error::RootsimError;
use crate::message::LpId;

/// Synthetic event type delivered once at LP creation, before any
/// model-scheduled event, with an empty payload.
pub const LP_INIT: u32 = 65534;

/// Synthetic event type delivered once at LP tear-down.
pub const LP_FINI: u32 = 65535;

/// `ScheduleNewEvent` (spec §6): the only legal way for a dispatch callback
/// to emit an event. Handed to `Dispatcher::dispatch` scoped to the LP and
/// timestamp currently being processed, so a scheduled time in the past of
/// `now` is rejected the same way [`crate::lp::LpContext::send`] rejects it.
pub trait Scheduler {
    fn schedule(&mut self, dest: LpId, time: f64, event_type: u32, payload: Vec<u8>) -> Result<(), RootsimError>;
}

/// Called for every positively processed event, including `LP_INIT` and
/// `LP_FINI`. `state` is whatever the model last registered via
/// `SetState`, or `None` before the first registration.
pub trait Dispatcher: Send + Sync {
    fn dispatch(
        &self,
        lp: LpId,
        now: f64,
        event_type: u32,
        payload: &[u8],
        state: Option<NonNull<u8>>,
        scheduler: &mut dyn Scheduler,
    );
}

/// Called once per LP on every GVT; the simulation ends once every LP on
/// every node reports `true`.
pub trait Committed: Send + Sync {
    fn committed(&self, lp: LpId, state: Option<NonNull<u8>>) -> bool;
}

/// A closure-backed [`Dispatcher`], for models that don't need to carry
/// extra state beyond what the closure captures.
pub struct FnDispatcher<F>(pub F)
where
    F: Fn(LpId, f64, u32, &[u8], Option<NonNull<u8>>, &mut dyn Scheduler) + Send + Sync;

impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(LpId, f64, u32, &[u8], Option<NonNull<u8>>, &mut dyn Scheduler) + Send + Sync,
{
    fn dispatch(
        &self,
        lp: LpId,
        now: f64,
        event_type: u32,
        payload: &[u8],
        state: Option<NonNull<u8>>,
        scheduler: &mut dyn Scheduler,
    ) {
        (self.0)(lp, now, event_type, payload, state, scheduler)
    }
}

pub struct FnCommitted<F>(pub F)
where
    F: Fn(LpId, Option<NonNull<u8>>) -> bool + Send + Sync;

impl<F> Committed for FnCommitted<F>
where
    F: Fn(LpId, Option<NonNull<u8>>) -> bool + Send + Sync,
{
    fn committed(&self, lp: LpId, state: Option<NonNull<u8>>) -> bool {
        (self.0)(lp, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopScheduler;
    impl Scheduler for NoopScheduler {
        fn schedule(&mut self, _dest: LpId, _time: f64, _event_type: u32, _payload: Vec<u8>) -> Result<(), RootsimError> {
            Ok(())
        }
    }

    #[test]
    fn fn_dispatcher_forwards_to_the_closure() {
        let calls = AtomicU32::new(0);
        let dispatcher = FnDispatcher(|_lp, _now, _ty, _payload, _state, _sched| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        dispatcher.dispatch(0, 1.0, LP_INIT, &[], None, &mut NoopScheduler);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fn_committed_forwards_the_result() {
        let committed = FnCommitted(|_lp, _state| true);
        assert!(committed.committed(0, None));
    }
}
