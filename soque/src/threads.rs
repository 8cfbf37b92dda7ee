// Worker pool over a set of strict-order queues. Worker i owns queue i's
// ingress/egress (when i is in range); every worker helps with processing on
// every queue, round-robin. A conductor thread samples per-worker completion
// counters and publishes how many workers are currently productive; surplus
// helpers read that scalar and park themselves.
use crate::soque::Soque;
use crate::max_threads;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default per-claim batch size.
pub const DEFAULT_BATCH: usize = 64;
/// Default items-per-second rate above which a worker counts as busy.
pub const DEFAULT_THRESHOLD: u32 = 10_000;
/// Default conductor sampling interval, milliseconds.
pub const DEFAULT_REACTION_MS: u64 = 50;

struct PoolShared {
    queues: Box<[Arc<Soque>]>,
    threads_count: usize,
    bind: bool,
    shutdown: AtomicBool,
    // Start barrier: callbacks do not run before every worker arrived.
    arrived: AtomicUsize,
    // Number of busy workers, published by the conductor, read by everyone.
    workers_count: AtomicUsize,
    batch: AtomicUsize,
    threshold: AtomicU32,
    reaction_ms: AtomicU64,
    // Cumulative items completed in proc, one single-writer counter per
    // worker. Wrap-safe: the conductor only looks at deltas.
    speeds: Box<[CachePadded<AtomicU32>]>,
}

pub struct SoqueThreads {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
    conductor: Option<thread::JoinHandle<()>>,
}

impl SoqueThreads {
    /// Spawn `threads` workers (0 means one per hardware thread, and never
    /// fewer than the number of queues) plus the conductor. With `bind`,
    /// workers that fit the hardware thread count pin themselves to cores
    /// 0, 1, 2, ... in order; the conductor is never pinned.
    pub fn open(threads: usize, bind: bool, queues: Vec<Arc<Soque>>) -> Self {
        assert!(!queues.is_empty(), "a pool needs at least one queue");

        let requested = if threads == 0 { max_threads() } else { threads };
        let threads_count = requested.max(queues.len());

        let speeds = (0..threads_count)
            .map(|_| CachePadded::new(AtomicU32::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(PoolShared {
            queues: queues.into_boxed_slice(),
            threads_count,
            bind,
            shutdown: AtomicBool::new(false),
            arrived: AtomicUsize::new(0),
            workers_count: AtomicUsize::new(0),
            batch: AtomicUsize::new(DEFAULT_BATCH),
            threshold: AtomicU32::new(DEFAULT_THRESHOLD),
            reaction_ms: AtomicU64::new(DEFAULT_REACTION_MS),
            speeds,
        });

        let mut workers = Vec::with_capacity(threads_count);
        for thread_id in 0..threads_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("soque-worker-{thread_id}"))
                .spawn(move || worker_loop(&shared, thread_id))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        let conductor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("soque-conductor".to_string())
                .spawn(move || conductor_loop(&shared))
                .expect("failed to spawn conductor thread")
        };

        Self {
            shared,
            workers,
            conductor: Some(conductor),
        }
    }

    /// Update the per-claim batch size, the busy-worker threshold (items/s)
    /// and the conductor reaction interval (ms). Safe to call at any time;
    /// the stores are racy but each loop re-reads them.
    pub fn tune(&self, batch: usize, threshold: u32, reaction_ms: u64) {
        self.shared.batch.store(batch.max(1), Ordering::Relaxed);
        self.shared.threshold.store(threshold, Ordering::Relaxed);
        self.shared
            .reaction_ms
            .store(reaction_ms.max(1), Ordering::Relaxed);
    }

    /// Number of workers the conductor currently considers productive.
    pub fn workers_count(&self) -> usize {
        self.shared.workers_count.load(Ordering::Relaxed)
    }

    /// Stop the loops and join every thread. In-flight claims complete
    /// before their worker exits; unclaimed filled slots are discarded.
    pub fn close(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.conductor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SoqueThreads {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn worker_loop(shared: &PoolShared, thread_id: usize) {
    if shared.bind && thread_id < max_threads() {
        pin_current_thread(thread_id);
    }

    shared.arrived.fetch_add(1, Ordering::AcqRel);
    while shared.arrived.load(Ordering::Acquire) < shared.threads_count {
        thread::yield_now();
    }

    let soques = shared.queues.len();
    // A helper ranked past the queue list parks until the conductor sees
    // enough busy workers to justify waking it.
    let wake_point = (thread_id >= soques).then_some(thread_id);
    let mut i = 0usize;

    while !shared.shutdown.load(Ordering::Acquire) {
        let soque = &shared.queues[i];
        let mut progress = false;

        // Proc step: every worker, every queue.
        let batch = shared.batch.load(Ordering::Relaxed);
        let (index, count) = soque.proc_get(batch);
        if count != 0 {
            soque.handler().proc(index, count);
            soque.proc_done(index, count);
            shared.speeds[thread_id].fetch_add(count as u32, Ordering::Relaxed);
            progress = true;
        }

        // I/O step: only the home worker, only when the gate is free.
        if i == thread_id && soque.pp_enter() {
            loop {
                let waitable = shared.workers_count.load(Ordering::Relaxed) == 0;

                let mut retired = 0;
                let ready = soque.pop(0);
                if ready != 0 {
                    retired = soque.handler().pop(ready, waitable).min(ready);
                    if retired != 0 {
                        soque.pop(retired);
                        progress = true;
                    }
                }

                let available = soque.push(0);
                if available != 0 {
                    let produced = soque.handler().push(available, waitable).min(available);
                    if produced != 0 {
                        let pushed = soque.push(produced);
                        debug_assert_eq!(pushed, produced);
                        progress = true;
                    }
                }

                // Keep the gate while retirement is flowing.
                if retired == 0 {
                    break;
                }
            }
            soque.pp_leave();
        }

        i += 1;
        if i == soques {
            i = 0;
        }

        if let Some(wake) = wake_point {
            if shared.workers_count.load(Ordering::Relaxed) < wake {
                thread::sleep(Duration::from_millis(
                    shared.reaction_ms.load(Ordering::Relaxed),
                ));
                continue;
            }
        }
        if !progress {
            thread::yield_now();
        }
    }
}

fn conductor_loop(shared: &PoolShared) {
    let mut prev = vec![0u32; shared.threads_count];
    let mut last = Instant::now();

    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(
            shared.reaction_ms.load(Ordering::Relaxed),
        ));

        let now = Instant::now();
        let elapsed = now.duration_since(last).as_secs_f64();
        last = now;
        if elapsed <= 0.0 {
            continue;
        }

        let threshold = f64::from(shared.threshold.load(Ordering::Relaxed));
        let mut hot = 0usize;
        let mut trickle = false;
        for (worker, prev_total) in prev.iter_mut().enumerate() {
            let total = shared.speeds[worker].load(Ordering::Relaxed);
            let rate = f64::from(total.wrapping_sub(*prev_total)) / elapsed;
            *prev_total = total;
            if rate >= threshold {
                hot += 1;
            } else if rate > threshold / 100.0 {
                trickle = true;
            }
        }
        // A slow but live pipeline still counts as one busy worker.
        if hot == 0 && trickle {
            hot = 1;
        }
        shared.workers_count.store(hot, Ordering::Relaxed);
    }
}

#[cfg(target_os = "linux")]
fn pin_current_thread(core: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if set.set(core).is_ok() {
        // Pid 0 targets the calling thread.
        let _ = sched_setaffinity(Pid::from_raw(0), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_core: usize) {}
