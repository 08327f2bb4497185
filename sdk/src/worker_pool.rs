// Pool of async workers that inbound messages are dispatched onto
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const DEFAULT_WORKERS: usize = 4;

/// A unit of work - runs to completion on one worker
pub type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    // Queue per worker, None once shut down
    worker_txs: Mutex<Option<Vec<mpsc::UnboundedSender<Job>>>>,

    // Next worker to hand a job to
    round_robin_index: AtomicUsize,
}

impl WorkerPool {
    /// Start `num_workers` workers on the current tokio runtime
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        info!("Creating worker pool with {} workers", num_workers);

        // Create a job queue for each worker
        let mut worker_txs = Vec::new();
        for worker in 0..num_workers {
            let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<Job>();
            worker_txs.push(worker_tx);

            // A panicking job is reported and the worker carries on
            tokio::spawn(async move {
                while let Some(job) = worker_rx.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!("Job panicked on worker {worker}");
                    }
                }
            });
        }

        Self {
            worker_txs: Mutex::new(Some(worker_txs)),
            round_robin_index: AtomicUsize::new(0),
        }
    }

    /// Queue a job - never blocks, so safe to call from a transport thread
    pub fn execute(&self, job: Job) {
        let worker_txs = match self.worker_txs.lock() {
            Ok(worker_txs) => worker_txs,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(worker_txs) = worker_txs.as_ref() else {
            warn!("Worker pool shut down, job dropped");
            return;
        };

        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % worker_txs.len();
        if let Err(e) = worker_txs[index].send(job) {
            error!("Failed to send job to worker: {}", e);
        }
    }

    /// Stop accepting jobs - already queued jobs still run
    pub fn shutdown(&self) {
        let mut worker_txs = match self.worker_txs.lock() {
            Ok(worker_txs) => worker_txs,
            Err(poisoned) => poisoned.into_inner(),
        };
        if worker_txs.take().is_some() {
            info!("Worker pool shut down");
        }
    }
}
