//! Global Virtual Time reduction (spec §4.7): the multi-phase protocol
//! that turns each thread's local minimum into a conservative lower bound
//! usable as the fossil-collection frontier.
//!
//! The two-color scheme lets a new round start before the previous
//! round's fossil collection finishes: `remote_sent`/`remote_received`
//! are indexed by a rotating color bit so in-flight counters from round
//! N don't get clobbered by round N+1's bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

/// Phase a thread is in during one GVT round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvtPhase {
    Idle,
    Started,
    AwaitingRemote,
    Reducing,
    Done,
}

/// Per-thread GVT bookkeeping.
pub struct ThreadGvtState {
    pub phase: GvtPhase,
    pub local_min: f64,
    /// Outgoing message counters for the current color, indexed by
    /// destination node.
    pub remote_sent: Vec<u64>,
}

impl ThreadGvtState {
    pub fn new(node_count: usize) -> Self {
        ThreadGvtState {
            phase: GvtPhase::Idle,
            local_min: f64::INFINITY,
            remote_sent: vec![0; node_count],
        }
    }

    /// `on_msg_extraction`: folds the timestamp of every message this
    /// thread extracts into the round's running local minimum.
    pub fn on_msg_extraction(&mut self, dest_t: f64) {
        if self.phase != GvtPhase::Idle && dest_t < self.local_min {
            self.local_min = dest_t;
        }
    }

    pub fn start_round(&mut self, lp_bound: f64) {
        self.phase = GvtPhase::Started;
        self.local_min = lp_bound;
        for c in &mut self.remote_sent {
            *c = 0;
        }
    }

    pub fn record_remote_send(&mut self, node: usize) {
        self.remote_sent[node] += 1;
    }
}

/// Node-wide GVT state shared across the node's worker threads.
pub struct GvtState {
    global_gvt: AtomicU64, // f64 bits, monotone non-decreasing
    /// Two-color counters: `remote_received[color]` is how many remote
    /// messages this node has received tagged with that color.
    remote_received: [AtomicU64; 2],
    color: std::sync::atomic::AtomicU32,
}

impl GvtState {
    pub fn new() -> Self {
        GvtState {
            global_gvt: AtomicU64::new(0.0f64.to_bits()),
            remote_received: [AtomicU64::new(0), AtomicU64::new(0)],
            color: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> f64 {
        f64::from_bits(self.global_gvt.load(Ordering::Acquire))
    }

    pub fn current_color(&self) -> usize {
        (self.color.load(Ordering::Acquire) & 1) as usize
    }

    pub fn record_remote_received(&self, color: usize) {
        self.remote_received[color].fetch_add(1, Ordering::AcqRel);
    }

    pub fn remote_received(&self, color: usize) -> u64 {
        self.remote_received[color].load(Ordering::Acquire)
    }

    /// Step 3: the node is clear to proceed once every remote message
    /// sent toward it under the old color has arrived.
    pub fn old_color_drained(&self, old_color: usize, expected: u64) -> bool {
        self.remote_received(old_color) >= expected
    }

    /// Steps 4-5: publish the reduced minimum as the new GVT and flip the
    /// color bit. `candidate` must already be the node-wide (and, in a
    /// multi-node deployment, the cross-node `MPI_Allreduce`-min-reduced)
    /// minimum.
    pub fn commit_round(&self, candidate: f64) -> f64 {
        let previous = self.current();
        let advanced = candidate.max(previous);
        self.global_gvt.store(advanced.to_bits(), Ordering::Release);
        let old_color = self.current_color();
        self.remote_received[old_color].store(0, Ordering::Release);
        self.color.fetch_add(1, Ordering::AcqRel);
        advanced
    }
}

impl Default for GvtState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce the threads' `local_min` and bound-vs-queue minima into this
/// node's contribution to the round. Spec §8 property 11: with a single
/// LP that never sends remote, this equals `min(bound, queue_peek_time)`.
pub fn reduce_local_minima(mins: &[f64]) -> f64 {
    mins.iter().copied().fold(f64::INFINITY, f64::min)
}
