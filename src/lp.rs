//! LP processing context (spec §4.4): owns one logical process's
//! `p_msgs` history, its rollback/anti-message machinery, the
//! straggler/early-anti detector, and its rollback-safe memory.
//!
//! Only the single thread currently bound to an LP ever touches its
//! [`LpContext`] — rebinding happens only at a GVT barrier — so nothing
//! in here needs interior mutability for its own state. The one piece of
//! cross-thread interaction is re-enqueuing a message onto another
//! thread's queue, which goes through [`Router`], itself built on the
//! already-synchronized [`crate::queue::ThreadQueue`].

use std::collections::VecDeque;

use crate::autockpt::AutoCkpt;
use crate::buddy::BuddyAllocator;
use crate::checkpoint::CheckpointStore;
use crate::error::RootsimError;
use crate::message::{msg_is_before, LpId, Message, RemoteMeta};
use crate::model::{Dispatcher, Scheduler};
use crate::transport::Transport;

/// Swallows `ScheduleNewEvent` calls made by a dispatch callback replayed
/// during coast-forward: the sends those events made the first time round
/// are already recorded in `p_msgs`, so issuing them again would duplicate
/// them.
struct SuppressedScheduler;

impl Scheduler for SuppressedScheduler {
    fn schedule(&mut self, _dest: LpId, _time: f64, _event_type: u32, _payload: Vec<u8>) -> Result<(), RootsimError> {
        Ok(())
    }
}

/// Marker carried alongside a `p_msgs` entry for a message this LP sent,
/// used to drive anti-message generation on rollback. Spec §9 notes the
/// original packs this into two spare pointer bits; a small tagged struct
/// is the direct Rust equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    /// A message this LP received and processed.
    None,
    /// A message this LP sent to a local destination.
    Local,
    /// A message this LP sent to a remote node.
    Remote,
}

struct PMsgEntry {
    msg: Message,
    kind: SentKind,
}

/// Where a destination LP lives, for routing a `send`.
pub enum Locality {
    Local { thread: usize },
    Remote { node: u32 },
}

/// Cross-thread routing surface `send` and rollback need: resolving an
/// LP's locality and handing a message to the right thread's inbox.
pub trait Router: Send + Sync {
    fn locality_of(&self, lp: LpId) -> Locality;
    fn enqueue_local(&self, from_thread: usize, dest_thread: usize, msg: Message);
}

/// A remote anti-message whose positive twin has not yet arrived.
pub struct EarlyAnti {
    pub origin_node: u32,
    pub m_seq: u64,
    pub lifetime_bound: f64,
}

/// Outcome of [`LpContext::handle_straggler`], describing what memory
/// state was restored so the caller can account for the restore's cost
/// (fed into the auto-ckpt controller).
pub struct RollbackOutcome {
    pub restored_ref_idx: usize,
    pub rollback_point: usize,
}

pub struct LpContext {
    pub id: LpId,
    pub home_thread: usize,
    state_ptr: Option<std::ptr::NonNull<u8>>,
    bound: Option<f64>,
    /// `ref_idx` of `p_msgs[0]`: fossil collection drops entries from the
    /// front, so the absolute index of a live entry is `base_ref_idx +`
    /// its position in this vector, not the position alone.
    base_ref_idx: usize,
    p_msgs: Vec<PMsgEntry>,
    early_antis: VecDeque<EarlyAnti>,
    fossil_epoch: u64,
    allocator: BuddyAllocator,
    checkpoints: CheckpointStore,
    pub auto_ckpt: AutoCkpt,
}

impl LpContext {
    /// `init(lp)`: allocate a fresh processing context. `arena_exp` sizes
    /// this LP's first buddy arena (spec's `B_TOTAL_EXP`).
    pub fn init(id: LpId, home_thread: usize, arena_exp: u32, initial_ckpt_interval: u32) -> Self {
        LpContext {
            id,
            home_thread,
            state_ptr: None,
            bound: None,
            base_ref_idx: 0,
            p_msgs: Vec::new(),
            early_antis: VecDeque::new(),
            fossil_epoch: 0,
            allocator: BuddyAllocator::new(arena_exp),
            checkpoints: CheckpointStore::new(),
            auto_ckpt: AutoCkpt::new(initial_ckpt_interval),
        }
    }

    /// `fini(lp)`: any early anti-message still parked with no positive
    /// twin is reclaimed here rather than leaking (spec §8 property 12).
    pub fn fini(&mut self) {
        self.early_antis.clear();
    }

    pub fn bound(&self) -> Option<f64> {
        self.bound
    }

    pub fn ref_idx(&self) -> usize {
        self.base_ref_idx + self.p_msgs.len()
    }

    /// `SetState`: the model registers its state root, typically during
    /// `LP_INIT`.
    pub fn set_state(&mut self, ptr: std::ptr::NonNull<u8>) {
        self.state_ptr = Some(ptr);
    }

    pub fn state_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.state_ptr
    }

    pub fn allocator(&self) -> &BuddyAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut BuddyAllocator {
        &mut self.allocator
    }

    /// `rs_malloc` family lands here: allocate from this LP's own
    /// rollback-safe arenas.
    pub fn rs_malloc(&mut self, exp: u32) -> Option<std::ptr::NonNull<u8>> {
        self.allocator.malloc(exp).and_then(|addr| std::ptr::NonNull::new(addr as *mut u8))
    }

    pub fn rs_free(&mut self, ptr: std::ptr::NonNull<u8>) {
        self.allocator.free(ptr.as_ptr() as usize);
    }

    /// Record a positively processed message: pushes it into `p_msgs` and
    /// advances `bound`. Called by the dispatch loop right after the
    /// dispatcher callback runs.
    pub fn handle_positive(&mut self, msg: Message) {
        self.bound = Some(msg.dest_t());
        self.p_msgs.push(PMsgEntry { msg, kind: SentKind::None });
    }

    /// Checkpoint this LP's memory at the current `ref_idx`, if the
    /// auto-ckpt controller says it's due.
    pub fn maybe_checkpoint(&mut self) {
        if self.auto_ckpt.due() {
            self.checkpoints.take(self.ref_idx(), &self.allocator);
        }
    }

    /// Drop every `p_msgs` entry whose `dest_t < gvt` from the front, and
    /// fossil the checkpoint log to match. Deferred-freeing a `SENT_REMOTE`
    /// entry's buffer has no Rust-side counterpart: dropping the `Vec`
    /// entry releases the last `Arc` handle this LP held on it directly.
    /// Returns the number of entries reclaimed.
    pub fn fossil_collect(&mut self, gvt: f64) -> usize {
        let cut = self
            .p_msgs
            .iter()
            .position(|e| e.msg.dest_t() >= gvt)
            .unwrap_or(self.p_msgs.len());
        if cut == 0 {
            return 0;
        }
        self.p_msgs.drain(..cut);
        self.base_ref_idx += cut;
        self.checkpoints.fossil(self.base_ref_idx);
        self.fossil_epoch += 1;
        cut
    }

    pub fn fossil_epoch(&self) -> u64 {
        self.fossil_epoch
    }

    pub fn force_checkpoint(&mut self) {
        self.checkpoints.take(self.ref_idx(), &self.allocator);
        self.checkpoints.force_full();
    }

    /// The most recently processed incoming message, if any, for a
    /// caller that needs the full total order (not just its `dest_t`) to
    /// decide whether a new extraction is really a straggler.
    pub fn last_processed(&self) -> Option<&Message> {
        self.p_msgs.iter().rev().find(|e| e.kind == SentKind::None).map(|e| &e.msg)
    }

    /// `handle_anti(msg)`: the exact pointer is somewhere in `p_msgs`
    /// (this LP already processed it); roll back to the entry right
    /// before it.
    pub fn handle_anti(
        &mut self,
        msg: &Message,
        router: &dyn Router,
        transport: &dyn Transport,
        dispatcher: &dyn Dispatcher,
    ) -> Option<RollbackOutcome> {
        let idx = self.p_msgs.iter().position(|e| e.kind == SentKind::None && &e.msg == msg)?;
        Some(self.rollback_to(idx, router, transport, dispatcher))
    }

    /// `handle_straggler(s_msg)`: find the newest entry strictly before
    /// `s_msg` in `msg_is_before` order, then roll back everything after
    /// it. Entries with a `SENT_*` marker are skipped by the comparison
    /// scan (they record outgoing, not incoming, traffic) but still get
    /// rolled back along with everything after the chosen point.
    pub fn handle_straggler(
        &mut self,
        s_msg: &Message,
        router: &dyn Router,
        transport: &dyn Transport,
        dispatcher: &dyn Dispatcher,
    ) -> RollbackOutcome {
        let mut keep = None;
        for (idx, entry) in self.p_msgs.iter().enumerate().rev() {
            if entry.kind != SentKind::None {
                continue;
            }
            if msg_is_before(&entry.msg, s_msg) {
                keep = Some(idx);
                break;
            }
        }
        let rollback_point = keep.map(|i| i + 1).unwrap_or(0);
        self.rollback_to(rollback_point, router, transport, dispatcher)
    }

    /// `rollback_point` is a local index into the current `p_msgs` vector.
    fn rollback_to(
        &mut self,
        rollback_point: usize,
        router: &dyn Router,
        transport: &dyn Transport,
        dispatcher: &dyn Dispatcher,
    ) -> RollbackOutcome {
        let absolute_target = self.base_ref_idx + rollback_point;
        // No reachable checkpoint only happens when nothing was ever taken
        // (e.g. rolling back before the first auto-ckpt fires); the arena
        // is still in its initial state in that case, so there is nothing
        // to rewrite.
        let restored = self.checkpoints.restore(absolute_target, &mut self.allocator).unwrap_or(self.base_ref_idx);
        self.auto_ckpt.register_bad(0.0);
        self.send_anti_messages(rollback_point, router, transport);
        self.coast_forward(restored, rollback_point, dispatcher);
        self.p_msgs.truncate(rollback_point);
        self.bound = self
            .p_msgs
            .iter()
            .rev()
            .find(|e| e.kind == SentKind::None)
            .map(|e| e.msg.dest_t());
        RollbackOutcome { restored_ref_idx: restored, rollback_point: absolute_target }
    }

    /// `restore` only rewinds memory to the nearest checkpoint at or
    /// before `rollback_point`; every kept entry between that checkpoint
    /// and `rollback_point` is silently re-executed here (scheduling
    /// suppressed, since those entries' own outgoing sends are already
    /// recorded) so live memory reflects the full kept history again, not
    /// just the older snapshot.
    fn coast_forward(&mut self, restored: usize, rollback_point: usize, dispatcher: &dyn Dispatcher) {
        let start = restored.saturating_sub(self.base_ref_idx).min(rollback_point);
        let mut scheduler = SuppressedScheduler;
        for entry in &self.p_msgs[start..rollback_point] {
            if entry.kind == SentKind::None {
                dispatcher.dispatch(self.id, entry.msg.dest_t(), entry.msg.m_type(), entry.msg.payload(), self.state_ptr, &mut scheduler);
            }
        }
    }

    /// Walk `p_msgs[past_i..]` undoing every entry: outgoing sends get
    /// anti-messaged or flagged in place, incoming processed entries get
    /// re-queued for natural reprocessing through the ordinary dispatch
    /// loop. `p_msgs` itself is truncated by the caller after this runs.
    fn send_anti_messages(&mut self, past_i: usize, router: &dyn Router, transport: &dyn Transport) {
        for entry in &self.p_msgs[past_i..] {
            match entry.kind {
                SentKind::Remote => {
                    entry.msg.mark_anti();
                    let node = entry.msg.remote().map(|r| r.origin_node).unwrap_or(0);
                    transport.remote_anti_send(entry.msg.clone(), node);
                }
                SentKind::Local => {
                    let prior = entry.msg.mark_anti();
                    if prior & crate::message::PROCESSED != 0 {
                        if let Locality::Local { thread } = router.locality_of(entry.msg.dest()) {
                            router.enqueue_local(self.home_thread, thread, entry.msg.clone());
                        }
                    }
                }
                SentKind::None => {
                    let prior = entry.msg.clear_processed();
                    if prior & crate::message::ANTI == 0 {
                        router.enqueue_local(self.home_thread, self.home_thread, entry.msg.clone());
                    }
                }
            }
        }
    }

    /// `handle_remote_anti`: an anti-message for a remote send arrived
    /// from the transport, identified by `(origin_node, m_seq)`. If the
    /// positive twin is already in `p_msgs`, roll back; otherwise park it
    /// in `early_antis` until the positive arrives.
    pub fn handle_remote_anti(
        &mut self,
        origin_node: u32,
        m_seq: u64,
        lifetime_bound: f64,
        router: &dyn Router,
        transport: &dyn Transport,
        dispatcher: &dyn Dispatcher,
    ) -> Option<RollbackOutcome> {
        let found = self.p_msgs.iter().position(|e| {
            e.kind == SentKind::None
                && e.msg.remote().map(|r| (r.origin_node, r.m_seq)) == Some((origin_node, m_seq))
        });
        match found {
            Some(idx) => Some(self.rollback_to(idx, router, transport, dispatcher)),
            None => {
                self.early_antis.push_front(EarlyAnti { origin_node, m_seq, lifetime_bound });
                None
            }
        }
    }

    /// A remote positive arrived; scan `early_antis` first and cancel on
    /// match before recording it normally.
    pub fn check_early_antis(&mut self, msg: &Message) -> bool {
        let remote = match msg.remote() {
            Some(r) => r,
            None => return false,
        };
        if let Some(pos) = self
            .early_antis
            .iter()
            .position(|e| e.origin_node == remote.origin_node && e.m_seq == remote.m_seq)
        {
            self.early_antis.remove(pos);
            true
        } else {
            false
        }
    }

    /// `send(dest, time, type, payload)`: pack the message, then route it
    /// either to the transport (remote) or the destination thread's inbox
    /// (local), recording a `SENT_*` marker in `p_msgs` either way.
    pub fn send(
        &mut self,
        dest: LpId,
        now: f64,
        time: f64,
        m_type: u32,
        payload: Vec<u8>,
        router: &dyn Router,
        transport: &dyn Transport,
    ) -> Result<(), RootsimError> {
        if time < now {
            return Err(RootsimError::TimeTravel);
        }
        match router.locality_of(dest) {
            Locality::Remote { node } => {
                let remote = RemoteMeta { origin_node: node, origin_thread: self.home_thread as u32, gvt_phase_bit: false, m_seq: self.p_msgs.len() as u64 };
                let msg = Message::pack_remote(self.id, dest, now, time, m_type, payload, remote);
                transport.remote_send(msg.clone(), node);
                self.p_msgs.push(PMsgEntry { msg, kind: SentKind::Remote });
            }
            Locality::Local { thread } => {
                let msg = Message::pack(self.id, dest, now, time, m_type, payload);
                router.enqueue_local(self.home_thread, thread, msg.clone());
                self.p_msgs.push(PMsgEntry { msg, kind: SentKind::Local });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FnDispatcher, LP_INIT};
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct SingleThreadRouter {
        delivered: Mutex<Vec<Message>>,
    }

    impl Router for SingleThreadRouter {
        fn locality_of(&self, _lp: LpId) -> Locality {
            Locality::Local { thread: 0 }
        }
        fn enqueue_local(&self, _from_thread: usize, _dest_thread: usize, msg: Message) {
            self.delivered.lock().unwrap().push(msg);
        }
    }

    fn msg(dest_t: f64) -> Message {
        Message::pack(0, 1, 0.0, dest_t, 0, vec![])
    }

    #[test]
    fn handle_positive_advances_bound() {
        let mut lp = LpContext::init(0, 0, 12, 4);
        lp.handle_positive(msg(1.0));
        assert_eq!(lp.bound(), Some(1.0));
        lp.handle_positive(msg(2.0));
        assert_eq!(lp.bound(), Some(2.0));
    }

    #[test]
    fn straggler_rolls_back_to_before_its_timestamp() {
        let mut lp = LpContext::init(0, 0, 12, 4);
        let router = SingleThreadRouter { delivered: Mutex::new(Vec::new()) };
        let transport = LoopbackTransport::new();
        for t in [1.0, 2.0, 3.0, 4.0, 5.0] {
            lp.handle_positive(msg(t));
        }
        let straggler = msg(3.5);
        let dispatcher = FnDispatcher(|_, _, _, _, _, _| {});
        let outcome = lp.handle_straggler(&straggler, &router, &transport, &dispatcher);
        assert_eq!(outcome.rollback_point, 3); // keeps entries for t=1,2,3
        assert_eq!(lp.bound(), Some(3.0));
        // entries for t=4,5 were re-queued for reprocessing
        assert_eq!(router.delivered.lock().unwrap().len(), 2);
    }

    #[test]
    fn anti_message_rolls_back_the_exact_entry() {
        let mut lp = LpContext::init(0, 0, 12, 4);
        let router = SingleThreadRouter { delivered: Mutex::new(Vec::new()) };
        let transport = LoopbackTransport::new();
        let a = msg(1.0);
        let b = msg(2.0);
        lp.handle_positive(a.clone());
        lp.handle_positive(b.clone());
        let dispatcher = FnDispatcher(|_, _, _, _, _, _| {});
        let outcome = lp.handle_anti(&b, &router, &transport, &dispatcher).unwrap();
        assert_eq!(outcome.rollback_point, 1);
        assert_eq!(lp.bound(), Some(1.0));
    }

    #[test]
    fn early_anti_parks_until_positive_arrives() {
        let mut lp = LpContext::init(0, 0, 12, 4);
        let router = SingleThreadRouter { delivered: Mutex::new(Vec::new()) };
        let transport = LoopbackTransport::new();
        let dispatcher = FnDispatcher(|_, _, _, _, _, _| {});
        assert!(lp.handle_remote_anti(7, 42, 100.0, &router, &transport, &dispatcher).is_none());
        let remote = RemoteMeta { origin_node: 7, origin_thread: 0, gvt_phase_bit: false, m_seq: 42 };
        let positive = Message::pack_remote(9, 0, 0.0, 5.0, 0, vec![], remote);
        assert!(lp.check_early_antis(&positive));
    }

    /// A straggler whose rollback point falls after a checkpoint (rather
    /// than exactly on one) must coast the LP's memory forward through
    /// every kept entry since that checkpoint, not just whatever `restore`
    /// rewound to.
    #[test]
    fn rollback_coasts_forward_through_entries_kept_since_the_last_checkpoint() {
        let mut lp = LpContext::init(0, 0, 12, 4);
        let router = SingleThreadRouter { delivered: Mutex::new(Vec::new()) };
        let transport = LoopbackTransport::new();

        lp.handle_positive(msg(1.0));
        lp.force_checkpoint(); // snapshot taken right after t=1.0, ref_idx 1
        lp.handle_positive(msg(2.0));
        lp.handle_positive(msg(3.0));
        lp.handle_positive(msg(4.0));

        let replayed = Arc::new(AtomicU32::new(0));
        let replayed_clone = replayed.clone();
        let dispatcher = FnDispatcher(move |_lp, _now, event_type, _payload, _state, scheduler: &mut dyn Scheduler| {
            if event_type != LP_INIT {
                replayed_clone.fetch_add(1, Ordering::Relaxed);
                // A replayed dispatch trying to schedule a new event must
                // be swallowed rather than landing in the router.
                let _ = scheduler.schedule(0, 100.0, 0, vec![]);
            }
        });

        let straggler = msg(3.5); // keeps t=1,2,3; rolls back t=4
        let outcome = lp.handle_straggler(&straggler, &router, &transport, &dispatcher);
        assert_eq!(outcome.rollback_point, 3);
        // t=2.0 and t=3.0 were kept but sat past the t=1.0 checkpoint, so
        // both must have been replayed.
        assert_eq!(replayed.load(Ordering::Relaxed), 2);
        // Only the rolled-back t=4.0 entry was re-queued through the
        // router; none of the replay's suppressed schedule calls were.
        assert_eq!(router.delivered.lock().unwrap().len(), 1);
    }
}
