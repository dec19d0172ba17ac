//! The work-stealing handler pool.
//!
//! Jobs enter through one bounded injector channel, so submission from loop
//! tasks is async with backpressure: when every worker is busy and the
//! injector is full, the submitting loop task suspends. Each worker parks a
//! small batch of injected jobs on its own local queue and idle workers
//! steal from their siblings, so work queued behind a slow handler never
//! strands there. User handlers only ever run on worker threads, never on
//! the event loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_queue::SegQueue;
use crossfire::{mpmc, MAsyncTx, MRx};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// How many injected jobs a worker parks locally per refill. Small, so the
/// bulk stays in the injector where any idle worker can take it directly.
const LOCAL_BATCH: usize = 8;

struct PoolShared {
    /// One queue per worker; pops from a sibling's queue are the steals.
    locals: Vec<SegQueue<Job>>,
}

pub(crate) struct WorkerPool {
    job_tx: Mutex<Option<MAsyncTx<Job>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let workers = if workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            workers
        };
        let (job_tx, job_rx) = mpmc::bounded_async::<Job>(queue_size);
        let injector: MRx<Job> = job_rx.into();
        let shared =
            Arc::new(PoolShared { locals: (0..workers).map(|_| SegQueue::new()).collect() });
        let mut threads = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = shared.clone();
            let injector = injector.clone();
            let handle = thread::Builder::new()
                .name(format!("triple-worker-{}", worker_id))
                .spawn(move || {
                    trace!("worker {} running", worker_id);
                    Self::run_worker(worker_id, &injector, &shared);
                    trace!("worker {} exit", worker_id);
                })
                .expect("spawn worker thread");
            threads.push(handle);
        }
        Self { job_tx: Mutex::new(Some(job_tx)), threads: Mutex::new(threads) }
    }

    fn run_worker(worker_id: usize, injector: &MRx<Job>, shared: &PoolShared) {
        loop {
            if let Some(job) = shared.locals[worker_id].pop() {
                Self::run_job(worker_id, job);
                continue;
            }
            if let Some(job) = Self::steal(shared, worker_id) {
                Self::run_job(worker_id, job);
                continue;
            }
            match injector.recv() {
                Ok(job) => {
                    // park a batch locally; siblings steal it if we stall
                    let mut grabbed = 0;
                    while grabbed < LOCAL_BATCH {
                        match injector.try_recv() {
                            Ok(extra) => {
                                shared.locals[worker_id].push(extra);
                                grabbed += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    Self::run_job(worker_id, job);
                }
                Err(_) => {
                    // injector closed; run out every local queue before exit
                    if shared.locals.iter().all(|queue| queue.is_empty()) {
                        return;
                    }
                    thread::yield_now();
                }
            }
        }
    }

    fn steal(shared: &PoolShared, worker_id: usize) -> Option<Job> {
        let workers = shared.locals.len();
        for offset in 1..workers {
            let victim = (worker_id + offset) % workers;
            if let Some(job) = shared.locals[victim].pop() {
                trace!("worker {} stole a job from worker {}", worker_id, victim);
                return Some(job);
            }
        }
        None
    }

    #[inline]
    fn run_job(worker_id: usize, job: Job) {
        // a panicking handler must not take the worker down
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("worker {}: handler panicked", worker_id);
        }
    }

    /// Submission handle for loop tasks. None once the pool is shut down.
    pub fn handle(&self) -> Option<MAsyncTx<Job>> {
        self.job_tx.lock().unwrap().clone()
    }

    /// Stop accepting jobs, run out the queues, join the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.job_tx.lock().unwrap().take();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
