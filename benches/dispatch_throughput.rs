//! Throughput of `Worker::step` in isolation, varying the number of LPs
//! sharing a single thread. Grounded on the teacher's
//! `benches/event_throughput.rs`: a parameterized `BenchmarkId` group
//! driven by `iter_with_setup` so the per-iteration setup cost (building a
//! fresh worker and seeding its queue) isn't counted against the measured
//! routine.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rootsim_core::dispatch::Worker;
use rootsim_core::gvt::GvtState;
use rootsim_core::lp::{Locality, LpContext, Router};
use rootsim_core::message::{LpId, Message};
use rootsim_core::model::{Dispatcher, FnCommitted, FnDispatcher, Scheduler};
use rootsim_core::queue::ThreadQueue;
use rootsim_core::remote_match::RemoteMatchMap;
use rootsim_core::transport::LoopbackTransport;

const EVT: u32 = 1;

/// A single-worker [`Router`]: every LP is local to thread 0, and routing
/// a send means inserting directly into that worker's own queue.
struct SingleThreadRouter {
    queue: Arc<Mutex<ThreadQueue>>,
}

impl Router for SingleThreadRouter {
    fn locality_of(&self, _lp: LpId) -> Locality {
        Locality::Local { thread: 0 }
    }

    fn enqueue_local(&self, from_thread: usize, _dest_thread: usize, msg: Message) {
        self.queue.lock().unwrap().insert(from_thread, msg);
    }
}

fn build_worker(num_lps: usize) -> Worker {
    let lps: Vec<LpContext> = (0..num_lps).map(|id| LpContext::init(id, 0, 16, 8)).collect();
    let lp_slot: Vec<usize> = (0..num_lps).collect();

    let queue = Arc::new(Mutex::new(ThreadQueue::new(1)));
    for id in 0..num_lps {
        queue.lock().unwrap().insert(0, Message::pack(id, id, 0.0, 1.0, EVT, Vec::new()));
    }
    let router = Arc::new(SingleThreadRouter { queue: queue.clone() });

    let dispatcher: Arc<dyn Dispatcher> = Arc::new(FnDispatcher(
        |lp: LpId, now: f64, event_type: u32, _payload: &[u8], _state, scheduler: &mut dyn Scheduler| {
            if event_type == EVT {
                let _ = scheduler.schedule(lp, now + 1.0, EVT, Vec::new());
            }
        },
    ));
    let committed = Arc::new(FnCommitted(|_lp, _state| false));

    Worker::new(
        0,
        queue,
        lps,
        lp_slot,
        router,
        Arc::new(LoopbackTransport::new()),
        Arc::new(Mutex::new(RemoteMatchMap::with_capacity(num_lps.max(8) * 2))),
        Arc::new(GvtState::new()),
        Arc::new(AtomicU64::new(f64::INFINITY.to_bits())),
        1,
        dispatcher,
        committed,
    )
}

fn bench_dispatch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_throughput");

    for num_lps in [1usize, 10, 100] {
        let steps = num_lps * 1_000;
        group.bench_with_input(BenchmarkId::new("lps", num_lps), &num_lps, |b, &num_lps| {
            b.iter_with_setup(
                || build_worker(num_lps),
                |mut worker| {
                    for _ in 0..steps {
                        black_box(worker.step());
                    }
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch_throughput);
criterion_main!(benches);
