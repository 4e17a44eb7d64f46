//! Top-level engine (spec §6): assigns LPs to worker threads round-robin,
//! spawns one OS thread per worker plus a master thread that drives GVT
//! rounds on a wall-clock timer, and joins everything back together on
//! termination.
//!
//! Grounded on the teacher's `TimeWarp`/`TimeWarpBuilder` pair in
//! `mt/optimistic/mod.rs`: a builder that collects configuration and LPs,
//! then a `run`/`run_until` pair that spawns a thread per logical unit of
//! work plus a dedicated coordination thread, joins every handle, and
//! turns a panicked join into [`RootsimError::ThreadPanic`] rather than
//! propagating the panic itself.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SimConfig;
use crate::dispatch::Worker;
use crate::error::RootsimError;
use crate::gvt::{reduce_local_minima, GvtState};
use crate::lp::{Locality, LpContext, Router};
use crate::message::{LpId, Message};
use crate::queue::ThreadQueue;
use crate::remote_match::RemoteMatchMap;
use crate::transport::{LoopbackTransport, Transport, GVT_DONE, GVT_START};

/// Concrete [`Router`] for a single node: every LP is homed to exactly one
/// worker thread, and routing a local send means locking that thread's
/// queue and inserting.
struct NodeRouter {
    lp_thread: Vec<usize>,
    queues: Vec<Arc<Mutex<ThreadQueue>>>,
}

impl Router for NodeRouter {
    fn locality_of(&self, lp: LpId) -> Locality {
        Locality::Local { thread: self.lp_thread[lp] }
    }

    fn enqueue_local(&self, from_thread: usize, dest_thread: usize, msg: Message) {
        self.queues[dest_thread].lock().unwrap().insert(from_thread, msg);
    }
}

/// Builds an [`Engine`] from a [`SimConfig`]: partitions LPs across
/// threads and constructs the shared node-wide state every worker holds a
/// handle to.
pub struct EngineBuilder {
    config: SimConfig,
}

impl EngineBuilder {
    pub fn new(config: SimConfig) -> Self {
        EngineBuilder { config }
    }

    pub fn build(self) -> Result<Engine, RootsimError> {
        self.config.validate()?;
        let n_threads = self.config.resolved_threads();
        let lps_total = self.config.lps;

        let mut lp_thread = vec![0usize; lps_total];
        for lp in 0..lps_total {
            lp_thread[lp] = lp % n_threads;
        }

        let queues: Vec<Arc<Mutex<ThreadQueue>>> =
            (0..n_threads).map(|_| Arc::new(Mutex::new(ThreadQueue::new(n_threads)))).collect();
        let router: Arc<dyn Router> = Arc::new(NodeRouter { lp_thread: lp_thread.clone(), queues: queues.clone() });
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let remote_match = Arc::new(Mutex::new(RemoteMatchMap::with_capacity(lps_total.max(8) * 2)));
        let gvt = Arc::new(GvtState::new());

        let mut per_thread_lps: Vec<Vec<LpContext>> = (0..n_threads).map(|_| Vec::new()).collect();
        let mut lp_slot = vec![usize::MAX; lps_total];
        for lp in 0..lps_total {
            let thread = lp_thread[lp];
            let local_idx = per_thread_lps[thread].len();
            per_thread_lps[thread].push(LpContext::init(
                lp,
                thread,
                self.config.arena_exp,
                self.config.initial_ckpt_interval(),
            ));
            lp_slot[lp] = local_idx;
        }

        let published_mins: Vec<Arc<AtomicU64>> =
            (0..n_threads).map(|_| Arc::new(AtomicU64::new(f64::INFINITY.to_bits()))).collect();

        let mut workers = Vec::with_capacity(n_threads);
        for (thread_id, lps) in per_thread_lps.into_iter().enumerate() {
            workers.push(Worker::new(
                thread_id,
                queues[thread_id].clone(),
                lps,
                lp_slot.clone(),
                router.clone(),
                transport.clone(),
                remote_match.clone(),
                gvt.clone(),
                published_mins[thread_id].clone(),
                1,
                self.config.dispatcher.clone(),
                self.config.committed.clone(),
            ));
        }

        Ok(Engine {
            workers,
            transport,
            gvt,
            published_mins,
            gvt_period: Duration::from_micros(self.config.gvt_period_us),
            termination_time: self.config.termination_time,
        })
    }
}

/// An engine ready to run. `workers.len()` OS threads plus one GVT
/// coordination thread are spawned by [`Engine::run`].
pub struct Engine {
    workers: Vec<Worker>,
    transport: Arc<dyn Transport>,
    gvt: Arc<GvtState>,
    published_mins: Vec<Arc<AtomicU64>>,
    gvt_period: Duration,
    termination_time: Option<f64>,
}

impl Engine {
    /// Run every worker to completion, coordinating GVT rounds from this
    /// (the calling) thread. Returns once every worker thread observes
    /// `TERMINATION`, either because fossil collection found every LP
    /// committable or because `termination_time` was reached.
    pub fn run(mut self) -> Result<(), RootsimError> {
        crate::logger::install(crate::config::LogLevel::Info);
        let done = Arc::new(AtomicBool::new(false));
        let idle_rounds = Arc::new(AtomicUsize::new(0));

        for worker in &mut self.workers {
            worker.init_all();
        }

        let mut handles = Vec::with_capacity(self.workers.len());
        for mut worker in self.workers {
            let done = done.clone();
            let idle_rounds = idle_rounds.clone();
            handles.push(thread::spawn(move || {
                loop {
                    if done.load(Ordering::Relaxed) {
                        break;
                    }
                    match worker.step() {
                        crate::dispatch::StepOutcome::Idle => {
                            idle_rounds.fetch_add(1, Ordering::Relaxed);
                            thread::sleep(Duration::from_micros(50));
                        }
                        _ => {
                            idle_rounds.store(0, Ordering::Relaxed);
                        }
                    }
                    if worker.is_terminated() {
                        done.store(true, Ordering::Relaxed);
                        break;
                    }
                }
                worker
            }));
        }

        let gvt_transport = self.transport.clone();
        let gvt_state = self.gvt.clone();
        let published_mins = self.published_mins.clone();
        let gvt_period = self.gvt_period;
        let termination_time = self.termination_time;
        let gvt_done = done.clone();
        let gvt_handle = thread::spawn(move || {
            let mut last_round = Instant::now();
            while !gvt_done.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_micros(200));
                if last_round.elapsed() < gvt_period {
                    continue;
                }
                last_round = Instant::now();
                gvt_transport.control_broadcast(GVT_START);
                // A real multi-node deployment waits on the
                // remote-received drain and runs an Allreduce here; the
                // loopback node has nothing in flight by construction, so
                // the round commits as soon as every worker has published
                // its post-`GVT_START` local minimum.
                thread::sleep(Duration::from_micros(200));
                let mins: Vec<f64> = published_mins.iter().map(|m| f64::from_bits(m.load(Ordering::Acquire))).collect();
                let candidate = reduce_local_minima(&mins);
                let advanced = gvt_state.commit_round(candidate);
                gvt_transport.control_broadcast(GVT_DONE);
                if let Some(t) = termination_time {
                    if advanced >= t {
                        gvt_done.store(true, Ordering::Relaxed);
                    }
                }
            }
        });

        for handle in handles {
            handle.join().map_err(|_| RootsimError::ThreadPanic)?;
        }
        gvt_handle.join().map_err(|_| RootsimError::ThreadPanic)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FnCommitted, FnDispatcher, Scheduler, LP_INIT};
    use std::sync::atomic::AtomicU32;

    #[test]
    fn build_partitions_lps_round_robin() {
        let dispatcher = Arc::new(FnDispatcher(|_, _, _, _, _, _| {}));
        let committed = Arc::new(FnCommitted(|_, _| true));
        let config = SimConfig::new(4, dispatcher, committed).with_threads(2);
        let engine = EngineBuilder::new(config).build().unwrap();
        assert_eq!(engine.workers.len(), 2);
        assert_eq!(engine.workers[0].lps().len(), 2);
        assert_eq!(engine.workers[1].lps().len(), 2);
    }

    #[test]
    fn run_terminates_when_every_lp_is_immediately_committable() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let dispatcher = Arc::new(FnDispatcher(move |_, _, _, _, _, _| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        }));
        let committed = Arc::new(FnCommitted(|_, _| true));
        let config = SimConfig::new(2, dispatcher, committed)
            .with_threads(1)
            .with_gvt_period_us(100);
        let engine = EngineBuilder::new(config).build().unwrap();
        engine.run().unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 4); // LP_INIT and LP_FINI for each of the 2 LPs
    }

    /// Two LPs batting a single event back and forth; `LP_INIT` on LP 0
    /// schedules the first hit, every dispatch schedules the return hit one
    /// virtual time unit later. Caps at 10 total hits (5 landing on each
    /// LP), matching a run where the 10th hit lands exactly at `t = 10.0`.
    #[test]
    fn scenario_ping_pong_terminates_with_five_hits_each() {
        const EVT: u32 = 7;
        const TOTAL_HITS: u32 = 10;

        let counts = Arc::new(Mutex::new([0u32; 2]));
        let counts_dispatch = counts.clone();
        let dispatcher = Arc::new(FnDispatcher(move |lp, now: f64, event_type: u32, _payload: &[u8], _state, scheduler: &mut dyn Scheduler| {
            if event_type == LP_INIT {
                if lp == 0 {
                    scheduler.schedule(1, 1.0, EVT, vec![]).unwrap();
                }
                return;
            }
            if event_type != EVT {
                return;
            }
            let mut counts = counts_dispatch.lock().unwrap();
            counts[lp] += 1;
            let total: u32 = counts.iter().sum();
            if total < TOTAL_HITS {
                scheduler.schedule(1 - lp, now + 1.0, EVT, vec![]).unwrap();
            }
        }));

        let counts_committed = counts.clone();
        let committed = Arc::new(FnCommitted(move |lp, _state| counts_committed.lock().unwrap()[lp] >= TOTAL_HITS / 2));

        let config = SimConfig::new(2, dispatcher, committed).with_threads(1).with_gvt_period_us(50);
        let engine = EngineBuilder::new(config).build().unwrap();
        engine.run().unwrap();

        assert_eq!(*counts.lock().unwrap(), [TOTAL_HITS / 2, TOTAL_HITS / 2]);
    }
}
