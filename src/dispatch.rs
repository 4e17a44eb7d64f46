//! Per-worker dispatch loop (spec §4.9): the single function every worker
//! thread spins in. Everything it touches — the thread's own
//! [`ThreadQueue`], the LPs it is bound to, the node's [`RemoteMatchMap`]
//! and [`GvtState`] — is either thread-owned or already internally
//! synchronized, so this module itself adds no locking of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::autockpt::CostModel;
use crate::error::RootsimError;
use crate::fossil;
use crate::gvt::{GvtState, ThreadGvtState};
use crate::lp::{LpContext, Router};
use crate::message::{msg_is_before, LpId, Message, ANTI};
use crate::model::{Committed, Dispatcher, Scheduler, LP_FINI, LP_INIT};
use crate::remote_match::{MatchKey, MatchOutcome, RemoteMatchMap};
use crate::transport::{Delivery, Transport, GVT_DONE, GVT_START, TERMINATION};

/// [`Scheduler`] handed to a dispatch callback: scopes `ScheduleNewEvent`
/// to the LP and timestamp currently being processed, so a new event is
/// just another [`LpContext::send`] recorded in that LP's `p_msgs` history.
struct LpScheduler<'a> {
    lp: &'a mut LpContext,
    now: f64,
    router: &'a dyn Router,
    transport: &'a dyn Transport,
}

impl<'a> Scheduler for LpScheduler<'a> {
    fn schedule(&mut self, dest: LpId, time: f64, event_type: u32, payload: Vec<u8>) -> Result<(), RootsimError> {
        self.lp.send(dest, self.now, time, event_type, payload, self.router, self.transport)
    }
}

/// What one call to [`Worker::step`] accomplished, for a caller (tests, or
/// the engine's own event loop) that wants to observe progress without
/// reaching into the worker's internals.
#[derive(Debug, PartialEq)]
pub enum StepOutcome {
    /// Nothing was pending on this thread's queue or transport.
    Idle,
    /// A message was dispatched to the model.
    Processed { lp: usize, dest_t: f64 },
    /// A straggler triggered a rollback before dispatch.
    RolledBack { lp: usize, rollback_point: usize },
    /// An already-processed message was undone by an anti-message.
    AntiApplied { lp: usize },
    /// The extracted message had already been canceled; no dispatch ran.
    Canceled,
}

/// Everything one worker thread owns plus handles to the node-wide state
/// it shares (read-mostly, or internally locked) with its siblings.
pub struct Worker {
    pub thread_id: usize,
    pub queue: Arc<Mutex<crate::queue::ThreadQueue>>,
    lps: Vec<LpContext>,
    /// Maps a global [`crate::message::LpId`] to this worker's local index
    /// into `lps`, or `usize::MAX` if the LP is not homed here.
    lp_slot: Vec<usize>,
    router: Arc<dyn Router>,
    transport: Arc<dyn Transport>,
    remote_match: Arc<Mutex<RemoteMatchMap>>,
    gvt: Arc<GvtState>,
    thread_gvt: ThreadGvtState,
    /// This worker's contribution to the node-wide GVT reduction, published
    /// lock-free so the coordination thread can read it without touching
    /// anything else this worker owns. Mirrors the teacher's per-LP
    /// `Arc<AtomicUsize>` local-time publication in `timewarp/gvt.rs`.
    published_min: Arc<AtomicU64>,
    dispatcher: Arc<dyn Dispatcher>,
    committed: Arc<dyn Committed>,
    last_fossil_gvt: f64,
    terminated: bool,
}

// SAFETY: `lps` holds each LP's `state_ptr` (a raw pointer into that LP's
// own buddy-allocated arena). A `Worker` is only ever accessed by the
// single thread it is moved into at spawn time (see `engine.rs`); the raw
// pointers it carries are never aliased across threads, so `Worker` can
// safely cross the thread boundary exactly once on construction.
unsafe impl Send for Worker {}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        thread_id: usize,
        queue: Arc<Mutex<crate::queue::ThreadQueue>>,
        lps: Vec<LpContext>,
        lp_slot: Vec<usize>,
        router: Arc<dyn Router>,
        transport: Arc<dyn Transport>,
        remote_match: Arc<Mutex<RemoteMatchMap>>,
        gvt: Arc<GvtState>,
        published_min: Arc<AtomicU64>,
        node_count: usize,
        dispatcher: Arc<dyn Dispatcher>,
        committed: Arc<dyn Committed>,
    ) -> Self {
        Worker {
            thread_id,
            queue,
            lps,
            lp_slot,
            router,
            transport,
            remote_match,
            gvt,
            thread_gvt: ThreadGvtState::new(node_count),
            published_min,
            dispatcher,
            committed,
            last_fossil_gvt: 0.0,
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn lps(&self) -> &[LpContext] {
        &self.lps
    }

    fn local_index(&self, lp: usize) -> Option<usize> {
        self.lp_slot.get(lp).copied().filter(|&i| i != usize::MAX)
    }

    /// Run `LP_INIT` for every LP this worker owns. Called once before the
    /// first `step`.
    pub fn init_all(&mut self) {
        for lp in &mut self.lps {
            let id = lp.id;
            let state = lp.state_ptr();
            let mut scheduler = LpScheduler { lp, now: 0.0, router: &*self.router, transport: &*self.transport };
            self.dispatcher.dispatch(id, 0.0, LP_INIT, &[], state, &mut scheduler);
        }
    }

    /// Run `LP_FINI` for every LP this worker owns. Called once a worker
    /// observes termination, before it exits its loop.
    pub fn fini_all(&mut self) {
        for lp in &mut self.lps {
            let id = lp.id;
            let bound = lp.bound().unwrap_or(0.0);
            let state = lp.state_ptr();
            let mut scheduler = LpScheduler { lp, now: bound, router: &*self.router, transport: &*self.transport };
            self.dispatcher.dispatch(id, bound, LP_FINI, &[], state, &mut scheduler);
        }
    }

    /// Drain whatever the transport has pending: control tags update GVT
    /// phase or flip `terminated`; data deliveries go through the
    /// remote-match map before landing in this thread's own queue.
    pub fn drain_transport(&mut self) {
        while let Some(delivery) = self.transport.receive_step() {
            match delivery {
                Delivery::Control { tag, .. } => self.handle_control(tag),
                Delivery::Data(msg) => self.handle_remote_arrival(msg),
            }
        }
    }

    fn handle_control(&mut self, tag: u32) {
        match tag {
            GVT_START => {
                let lp_bound = self
                    .lps
                    .iter()
                    .filter_map(|lp| lp.bound())
                    .fold(f64::INFINITY, f64::min)
                    .min(self.queue.lock().unwrap().peek_time().unwrap_or(f64::INFINITY));
                self.thread_gvt.start_round(lp_bound);
            }
            GVT_DONE => {
                self.run_fossil(self.gvt.current());
            }
            TERMINATION => {
                self.fini_all();
                self.terminated = true;
            }
            _ => {}
        }
    }

    /// A message arrived from another node. Positive and anti arrivals are
    /// rendezvoused through the shared [`RemoteMatchMap`] before either one
    /// is allowed to reach an LP, so a positive/anti pair that crosses the
    /// network out of order still cancels correctly.
    fn handle_remote_arrival(&mut self, msg: Message) {
        let remote = match msg.remote() {
            Some(r) => r,
            None => {
                self.queue.lock().unwrap().insert(self.thread_id, msg);
                return;
            }
        };
        let key = MatchKey { msg_id: msg.id(), origin_node: remote.origin_node };
        let is_anti = msg.is_anti();
        let mut map = self.remote_match.lock().unwrap();
        if is_anti {
            match map.arrive_anti(key, msg.dest_t()) {
                MatchOutcome::Parked => {}
                MatchOutcome::Cancel(positive) => {
                    drop(map);
                    self.apply_remote_cancel(positive);
                }
            }
        } else {
            match map.arrive_positive(key, msg.dest_t(), msg.clone()) {
                MatchOutcome::Parked => {
                    drop(map);
                    self.queue.lock().unwrap().insert(self.thread_id, msg);
                }
                MatchOutcome::Cancel(positive) => {
                    drop(map);
                    self.apply_remote_cancel(positive);
                }
            }
        }
    }

    /// A remote anti-message matched its positive. If the positive was
    /// already dispatched, the owning LP must roll back; otherwise marking
    /// `ANTI` is enough, since the next extraction sees the flag and
    /// treats it as a no-op.
    fn apply_remote_cancel(&mut self, positive: Message) {
        let prior = positive.mark_anti();
        if prior & crate::message::PROCESSED != 0 {
            if let Some(idx) = self.local_index(positive.dest()) {
                self.lps[idx].handle_anti(&positive, &*self.router, &*self.transport, &*self.dispatcher);
            }
        }
    }

    /// One iteration of the loop outlined in the pseudocode this module is
    /// grounded on: extract, classify by flags, straggler-check, dispatch.
    /// Always publishes this worker's current lower bound before
    /// returning, regardless of which branch below was taken.
    pub fn step(&mut self) -> StepOutcome {
        let outcome = self.step_inner();
        self.publish_local_min();
        outcome
    }

    fn publish_local_min(&mut self) {
        let min = self.local_min();
        self.published_min.store(min.to_bits(), Ordering::Release);
    }

    fn step_inner(&mut self) -> StepOutcome {
        self.drain_transport();
        let msg = match self.queue.lock().unwrap().extract() {
            Some(m) => m,
            None => return StepOutcome::Idle,
        };
        self.thread_gvt.on_msg_extraction(msg.dest_t());

        let lp_idx = match self.local_index(msg.dest()) {
            Some(i) => i,
            None => return StepOutcome::Idle,
        };

        let flags_before = msg.mark_processed();
        if flags_before & ANTI != 0 {
            self.lps[lp_idx].handle_anti(&msg, &*self.router, &*self.transport, &*self.dispatcher);
            return StepOutcome::AntiApplied { lp: msg.dest() };
        }
        if self.lps[lp_idx].check_early_antis(&msg) {
            return StepOutcome::Canceled;
        }

        let needs_rollback = self.lps[lp_idx]
            .last_processed()
            .map(|last| msg_is_before(&msg, last))
            .unwrap_or(false);
        let mut rollback_point = None;
        if needs_rollback {
            let outcome = self.lps[lp_idx].handle_straggler(&msg, &*self.router, &*self.transport, &*self.dispatcher);
            rollback_point = Some(outcome.rollback_point);
        }

        let state = self.lps[lp_idx].state_ptr();
        let dest_t = msg.dest_t();
        let mut scheduler = LpScheduler { lp: &mut self.lps[lp_idx], now: dest_t, router: &*self.router, transport: &*self.transport };
        self.dispatcher.dispatch(msg.dest(), dest_t, msg.m_type(), msg.payload(), state, &mut scheduler);
        self.lps[lp_idx].handle_positive(msg.clone());
        self.lps[lp_idx].auto_ckpt.register_good();
        self.lps[lp_idx].maybe_checkpoint();

        match rollback_point {
            Some(rollback_point) => StepOutcome::RolledBack { lp: msg.dest(), rollback_point },
            None => StepOutcome::Processed { lp: msg.dest(), dest_t: msg.dest_t() },
        }
    }

    /// Run fossil collection plus termination detection for every LP this
    /// worker owns, at the given (already node-wide-committed) GVT.
    pub fn run_fossil(&mut self, gvt: f64) {
        if !fossil::needs_run(self.last_fossil_gvt, gvt) {
            return;
        }
        for lp in &mut self.lps {
            lp.auto_ckpt.recompute();
        }
        let report = fossil::collect_all(&mut self.lps, gvt, &*self.committed);
        self.last_fossil_gvt = gvt;
        if report.all_committable {
            self.transport.control_broadcast(TERMINATION);
            self.fini_all();
            self.terminated = true;
        }
    }

    pub fn local_min(&mut self) -> f64 {
        self.thread_gvt.local_min.min(self.queue.lock().unwrap().peek_time().unwrap_or(f64::INFINITY))
    }
}

/// Dummy [`CostModel`] re-export point kept here rather than in
/// `autockpt` itself so the dispatch loop's `recompute` call above has a
/// single obvious place to swap in a different rule without touching
/// `autockpt.rs`.
pub fn install_cost_model(lp: &mut LpContext, model: Box<dyn CostModel>) {
    let ckpt = std::mem::replace(&mut lp.auto_ckpt, crate::autockpt::AutoCkpt::new(1));
    lp.auto_ckpt = ckpt.with_cost_model(model);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lp::Locality;
    use crate::message::LpId;
    use crate::model::{FnCommitted, FnDispatcher};
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct LocalRouter;
    impl Router for LocalRouter {
        fn locality_of(&self, _lp: LpId) -> Locality {
            Locality::Local { thread: 0 }
        }
        fn enqueue_local(&self, _from_thread: usize, _dest_thread: usize, _msg: Message) {}
    }

    fn make_worker(calls: Arc<AtomicU32>) -> Worker {
        let lps = vec![LpContext::init(0, 0, 12, 4)];
        let lp_slot = vec![0usize];
        let dispatcher = Arc::new(FnDispatcher(move |_lp, _now, _ty, _payload, _state, _sched| {
            calls.fetch_add(1, Ordering::Relaxed);
        }));
        let committed = Arc::new(FnCommitted(|_lp, _state| false));
        Worker::new(
            0,
            Arc::new(Mutex::new(crate::queue::ThreadQueue::new(1))),
            lps,
            lp_slot,
            Arc::new(LocalRouter),
            Arc::new(LoopbackTransport::new()),
            Arc::new(Mutex::new(RemoteMatchMap::with_capacity(8))),
            Arc::new(GvtState::new()),
            Arc::new(AtomicU64::new(f64::INFINITY.to_bits())),
            1,
            dispatcher,
            committed,
        )
    }

    #[test]
    fn step_on_empty_queue_is_idle() {
        let mut worker = make_worker(Arc::new(AtomicU32::new(0)));
        assert_eq!(worker.step(), StepOutcome::Idle);
    }

    #[test]
    fn step_dispatches_a_single_message() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut worker = make_worker(calls.clone());
        worker.queue.lock().unwrap().insert(0, Message::pack(0, 0, 0.0, 1.0, 0, vec![]));
        assert_eq!(worker.step(), StepOutcome::Processed { lp: 0, dest_t: 1.0 });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn straggler_triggers_rollback_then_redispatch() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut worker = make_worker(calls.clone());
        worker.queue.lock().unwrap().insert(0, Message::pack(0, 0, 0.0, 5.0, 0, vec![]));
        worker.step();
        worker.queue.lock().unwrap().insert(0, Message::pack(0, 0, 0.0, 2.0, 0, vec![]));
        match worker.step() {
            StepOutcome::RolledBack { lp, .. } => assert_eq!(lp, 0),
            other => panic!("expected a rollback, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn fossil_broadcasts_termination_once_every_lp_is_committable() {
        let lps = vec![LpContext::init(0, 0, 12, 4)];
        let lp_slot = vec![0usize];
        let dispatcher = Arc::new(FnDispatcher(|_, _, _, _, _, _| {}));
        let committed = Arc::new(FnCommitted(|_, _| true));
        let transport = Arc::new(LoopbackTransport::new());
        let mut worker = Worker::new(
            0,
            Arc::new(Mutex::new(crate::queue::ThreadQueue::new(1))),
            lps,
            lp_slot,
            Arc::new(LocalRouter),
            transport.clone(),
            Arc::new(Mutex::new(RemoteMatchMap::with_capacity(8))),
            Arc::new(GvtState::new()),
            Arc::new(AtomicU64::new(f64::INFINITY.to_bits())),
            1,
            dispatcher,
            committed,
        );
        worker.run_fossil(1.0);
        assert!(worker.is_terminated());
    }
}
