// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size pool of delivery worker threads.
//!
//! ```text
//!   producer ──submit──> [ unbounded queue ] ──> worker 1 ──┐
//!                                           ├──> worker 2 ──┼──> DeliverySink
//!                                           └──> worker N ──┘        │
//!                                                          failures  v
//!                                                        ErrorAggregator
//! ```
//!
//! Workers are OS threads that block on the shared queue and bridge into the
//! tokio runtime for the HTTP call. The queue and the error aggregator are
//! the only state they share with the producer.
//!
//! [`DeliveryPool::quiesce`] is the shutdown sequence: wait until every
//! submitted batch has been handled, then send one stop marker per worker and
//! join them. Dropping a pool that was not quiesced still sends the stop
//! markers, so workers exit after draining what is queued.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::batcher::{Batch, BatchSubmitter};
use crate::constants::{
    DEFAULT_WORKER_COUNT, MAX_WORKER_COUNT, WORKER_SIZE_STEPS, WORKER_START_ATTEMPTS,
    WORKER_START_PAUSE,
};
use crate::errors::{DeliveryFailure, ErrorAggregator};
use crate::sink::DeliverySink;

/// Reason recorded when not a single worker could be started.
pub const NO_WORKERS_REASON: &str = "Cant Start Any Threads";

/// Reason recorded for a batch whose delivery panicked.
pub const WORKER_PANIC_REASON: &str = "Delivery worker panicked";

/// Reason recorded when every worker exited with batches still queued.
pub const WORKERS_EXITED_REASON: &str = "Delivery workers exited with batches pending";

/// Worker count for a triggering object of `size` bytes.
#[must_use]
pub fn worker_count_for_size(size: u64) -> usize {
    WORKER_SIZE_STEPS
        .iter()
        .find(|(upper, _)| size <= *upper)
        .map_or(MAX_WORKER_COUNT, |(_, workers)| *workers)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub start_attempts: u32,
    pub start_pause: Duration,
    /// Log every batch a worker picks up.
    pub verbose: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: DEFAULT_WORKER_COUNT,
            start_attempts: WORKER_START_ATTEMPTS,
            start_pause: WORKER_START_PAUSE,
            verbose: false,
        }
    }
}

#[derive(Debug)]
enum WorkItem {
    Deliver(Batch),
    Stop,
}

/// Producer side of the pool queue.
#[derive(Clone, Debug)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<WorkItem>,
    pending: Arc<watch::Sender<usize>>,
}

impl PoolHandle {
    /// Batches submitted and not yet handled by a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }
}

impl BatchSubmitter for PoolHandle {
    fn submit(&self, batch: Batch) {
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(WorkItem::Deliver(batch)).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            error!("Delivery queue is closed, dropping batch");
        }
    }
}

type WorkerBody = Box<dyn FnOnce() + Send>;

pub struct DeliveryPool {
    handle: PoolHandle,
    workers: Vec<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
    stopped: bool,
}

impl DeliveryPool {
    /// Starts `config.workers` threads, retrying each one up to
    /// `config.start_attempts` times.
    ///
    /// When no thread starts at all, a failure is recorded in `errors` and the
    /// returned pool has no workers; callers must not route batches to it.
    pub async fn start(
        config: &PoolConfig,
        sink: Arc<dyn DeliverySink>,
        errors: ErrorAggregator,
    ) -> Self {
        let mut spawn = |name: String, work: WorkerBody| -> io::Result<JoinHandle<()>> {
            thread::Builder::new().name(name).spawn(work)
        };
        Self::start_with(config, sink, errors, &mut spawn).await
    }

    async fn start_with<F>(
        config: &PoolConfig,
        sink: Arc<dyn DeliverySink>,
        errors: ErrorAggregator,
        spawn: &mut F,
    ) -> Self
    where
        F: FnMut(String, WorkerBody) -> io::Result<JoinHandle<()>> + Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(rx));
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let live = Arc::new(AtomicUsize::new(0));
        let runtime = Handle::current();

        debug!("Requested delivery workers: {}", config.workers);

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            for attempt in 1..=config.start_attempts {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&queue),
                    sink: Arc::clone(&sink),
                    errors: errors.clone(),
                    pending: Arc::clone(&pending),
                    live: Arc::clone(&live),
                    runtime: runtime.clone(),
                    verbose: config.verbose,
                };
                match spawn(format!("grazer-delivery-{id}"), Box::new(move || worker.run())) {
                    Ok(join) => {
                        live.fetch_add(1, Ordering::SeqCst);
                        workers.push(join);
                        break;
                    }
                    Err(e) => {
                        warn!("Can't start delivery worker {id} (attempt {attempt}): {e}");
                        if attempt < config.start_attempts {
                            tokio::time::sleep(config.start_pause).await;
                        }
                    }
                }
            }
        }

        if workers.is_empty() {
            errors.record(DeliveryFailure::transport(NO_WORKERS_REASON));
        } else {
            debug!(
                "Started {} delivery workers out of {} requested",
                workers.len(),
                config.workers
            );
        }

        DeliveryPool {
            handle: PoolHandle { tx, pending },
            workers,
            live,
            stopped: false,
        }
    }

    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Number of worker threads that started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.workers.len()
    }

    /// Worker threads that have not exited yet.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Waits until every batch submitted so far has been handled, leaving the
    /// workers running. Returns `false` when the workers exited first.
    pub async fn drain(&self) -> bool {
        if self.workers.is_empty() {
            return self.handle.pending() == 0;
        }
        let live = Arc::clone(&self.live);
        let mut pending = self.handle.pending.subscribe();
        // Workers wake this waiter on exit too, so a dead pool cannot hang it.
        pending
            .wait_for(|n| *n == 0 || live.load(Ordering::SeqCst) == 0)
            .await
            .map(|n| *n == 0)
            .unwrap_or(false)
    }

    /// Waits for every submitted batch to be handled, then stops and joins
    /// the workers. Returns the number of workers joined.
    pub async fn quiesce(mut self) -> usize {
        if self.workers.is_empty() {
            let dropped = self.handle.pending();
            if dropped > 0 {
                error!("No delivery workers running, {dropped} batches were not delivered");
            }
            self.stopped = true;
            return 0;
        }

        if !self.drain().await {
            error!(
                "Delivery workers exited with {} batches pending",
                self.handle.pending()
            );
        }

        self.send_stop_markers();
        let workers = std::mem::take(&mut self.workers);
        let joined = workers.len();
        let result = tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    error!("Delivery worker panicked");
                }
            }
        })
        .await;
        if let Err(e) = result {
            error!("Failed to join delivery workers: {e}");
        }
        debug!("Delivery pool quiesced, {joined} workers stopped");
        joined
    }

    fn send_stop_markers(&mut self) {
        for _ in 0..self.workers.len() {
            if self.handle.tx.send(WorkItem::Stop).is_err() {
                break;
            }
        }
        self.stopped = true;
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        if !self.stopped {
            debug!("Delivery pool dropped without quiesce, stopping workers");
            self.send_stop_markers();
        }
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    sink: Arc<dyn DeliverySink>,
    errors: ErrorAggregator,
    pending: Arc<watch::Sender<usize>>,
    live: Arc<AtomicUsize>,
    runtime: Handle,
    verbose: bool,
}

impl Worker {
    fn run(self) {
        let _exit = ExitGuard {
            live: &self.live,
            pending: &self.pending,
        };
        loop {
            let item = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                queue.blocking_recv()
            };
            match item {
                Some(WorkItem::Deliver(batch)) => self.deliver(&batch),
                Some(WorkItem::Stop) | None => break,
            }
        }
    }

    fn deliver(&self, batch: &Batch) {
        let _done = Completion {
            pending: &self.pending,
            errors: &self.errors,
        };
        if self.verbose {
            debug!(
                "Worker {} delivering {} events ({} bytes)",
                self.id,
                batch.len(),
                batch.bytes()
            );
        }
        let outcome = self.runtime.block_on(self.sink.send(batch.payload()));
        self.errors.observe(outcome);
    }
}

/// Marks one batch as handled. A panicking delivery counts as a failure.
struct Completion<'a> {
    pending: &'a watch::Sender<usize>,
    errors: &'a ErrorAggregator,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.errors.record(DeliveryFailure::transport(WORKER_PANIC_REASON));
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct ExitGuard<'a> {
    live: &'a AtomicUsize,
    pending: &'a watch::Sender<usize>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.pending.send_modify(|_| {});
    }
}
