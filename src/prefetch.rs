//! Asynchronous prefetch pipeline
//!
//! Decouples trace decoding from replay. One background producer fills
//! per-consumer outboxes with batches of decoded calls, and one background
//! reclaimer frees call records the replay has finished with, so neither
//! decoding nor deallocation sits on the replay hot path.
//!
//! ```text
//!  ThreadedParser ──request_fill──▶ inbox (1 slot) ──▶ producer thread
//!        ▲                                                │ parse batch
//!        └────────── take batch ◀── outbox (per consumer) ◀┘
//!
//!  ThreadedParser ──retire──▶ SegQueue ──▶ reclaimer thread (drop)
//! ```
//!
//! Both workers start lazily on first use and live until the `Prefetcher` is
//! dropped. When there is nothing to do they sleep for `idle_sleep_us`
//! rather than block; that polling latency is accepted.

use crate::call::{Call, CallRef};
use crate::error::{ReplayError, TraceError};
use crate::source::CallSource;
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Source shared between a consumer and the producer thread
pub type SharedSource = Arc<Mutex<Box<dyn CallSource>>>;

/// Prefetch tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Calls decoded per fill request
    pub batch_size: usize,
    /// Local queue length at which a consumer asks for more
    pub low_water: usize,
    /// Sleep between polls when a worker has nothing to do
    pub idle_sleep_us: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            low_water: 8,
            idle_sleep_us: 1_000,
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.batch_size == 0 {
            return Err(ReplayError::InvalidConfig("batch_size must be > 0".to_string()));
        }
        if self.low_water >= self.batch_size {
            return Err(ReplayError::InvalidConfig(format!(
                "low_water ({}) must be smaller than batch_size ({})",
                self.low_water, self.batch_size
            )));
        }
        Ok(())
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us.max(1))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-consumer outbox contents, guarded by [`ConsumerSlot`]
#[derive(Default)]
pub(crate) struct Outbox {
    pub(crate) batch: VecDeque<Call>,
    /// A fill request for this consumer is queued or being served
    pub(crate) pending: bool,
    /// The producer hit end of stream on the last fill
    pub(crate) eof: bool,
    pub(crate) error: Option<TraceError>,
}

/// Mailbox the producer deposits batches into for one consumer
pub struct ConsumerSlot {
    id: u64,
    pub(crate) outbox: Mutex<Outbox>,
    pub(crate) ready: Condvar,
}

impl ConsumerSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn wait_idle<'a>(&'a self, mut outbox: MutexGuard<'a, Outbox>) -> MutexGuard<'a, Outbox> {
        while outbox.pending {
            outbox = self
                .ready
                .wait(outbox)
                .unwrap_or_else(PoisonError::into_inner);
        }
        outbox
    }
}

#[derive(Clone)]
struct FillRequest {
    slot: Arc<ConsumerSlot>,
    source: SharedSource,
    limit: usize,
}

struct Filled {
    batch: VecDeque<Call>,
    eof: bool,
    error: Option<TraceError>,
}

impl Filled {
    fn deposit(self, slot: &ConsumerSlot) {
        let mut outbox = lock(&slot.outbox);
        outbox.batch.extend(self.batch);
        outbox.eof = self.eof;
        if self.error.is_some() {
            outbox.error = self.error;
        }
        outbox.pending = false;
        slot.ready.notify_all();
    }
}

#[derive(Default)]
struct Counters {
    requests_accepted: AtomicU64,
    requests_rejected: AtomicU64,
    batches: AtomicU64,
    calls_produced: AtomicU64,
    calls_retired: AtomicU64,
    calls_reclaimed: AtomicU64,
}

/// Pipeline statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchStats {
    pub requests_accepted: u64,
    pub requests_rejected: u64,
    pub batches: u64,
    pub calls_produced: u64,
    pub calls_retired: u64,
    pub calls_reclaimed: u64,
}

/// Shared background producer and reclaimer
pub struct Prefetcher {
    config: PrefetchConfig,
    inbox: Arc<Mutex<Option<FillRequest>>>,
    retired: Arc<SegQueue<CallRef>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    next_consumer: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            inbox: Arc::new(Mutex::new(None)),
            retired: Arc::new(SegQueue::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            next_consumer: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Register a new consumer and return its outbox
    pub fn register(&self) -> Arc<ConsumerSlot> {
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        Arc::new(ConsumerSlot {
            id,
            outbox: Mutex::new(Outbox::default()),
            ready: Condvar::new(),
        })
    }

    /// Ask the producer to fill `slot` from `source`
    ///
    /// Returns `false` without blocking when another request already occupies
    /// the inbox; the caller is expected to retry later.
    pub fn request_fill(&self, slot: &Arc<ConsumerSlot>, source: &SharedSource) -> bool {
        self.ensure_started();

        let mut inbox = lock(&self.inbox);
        if inbox.is_some() {
            self.counters
                .requests_rejected
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }

        {
            let mut outbox = lock(&slot.outbox);
            if outbox.pending {
                // Already queued for this consumer.
                return true;
            }
            outbox.pending = true;
        }
        *inbox = Some(FillRequest {
            slot: slot.clone(),
            source: source.clone(),
            limit: self.config.batch_size,
        });
        self.counters
            .requests_accepted
            .fetch_add(1, Ordering::Relaxed);
        tracing::trace!(consumer = slot.id, "fill request accepted");
        true
    }

    /// Hand consumed calls to the reclaimer
    pub fn retire<I>(&self, calls: I)
    where
        I: IntoIterator<Item = CallRef>,
    {
        self.ensure_started();
        let mut n = 0u64;
        for call in calls {
            self.retired.push(call);
            n += 1;
        }
        self.counters.calls_retired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PrefetchStats {
        let c = &self.counters;
        PrefetchStats {
            requests_accepted: c.requests_accepted.load(Ordering::Relaxed),
            requests_rejected: c.requests_rejected.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            calls_produced: c.calls_produced.load(Ordering::Relaxed),
            calls_retired: c.calls_retired.load(Ordering::Relaxed),
            calls_reclaimed: c.calls_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Whether the worker threads have been started
    pub fn is_running(&self) -> bool {
        !lock(&self.workers).is_empty()
    }

    fn ensure_started(&self) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }

        let inbox = self.inbox.clone();
        let shutdown = self.shutdown.clone();
        let counters = self.counters.clone();
        let idle = self.config.idle_sleep();
        workers.push(
            thread::Builder::new()
                .name("prefetch-producer".into())
                .spawn(move || Self::producer_worker(inbox, shutdown, counters, idle))
                .unwrap_or_else(|e| panic!("failed to spawn prefetch producer: {}", e)),
        );

        let retired = self.retired.clone();
        let shutdown = self.shutdown.clone();
        let counters = self.counters.clone();
        workers.push(
            thread::Builder::new()
                .name("prefetch-reclaimer".into())
                .spawn(move || Self::reclaimer_worker(retired, shutdown, counters, idle))
                .unwrap_or_else(|e| panic!("failed to spawn prefetch reclaimer: {}", e)),
        );
        tracing::debug!("prefetch workers started");
    }

    fn producer_worker(
        inbox: Arc<Mutex<Option<FillRequest>>>,
        shutdown: Arc<AtomicBool>,
        counters: Arc<Counters>,
        idle: Duration,
    ) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            // The request stays in the inbox until served, which keeps
            // further submissions rejected meanwhile.
            let request = lock(&inbox).clone();
            match request {
                Some(request) => {
                    let filled = Self::fill(&request, &counters);
                    let mut inbox = lock(&inbox);
                    *inbox = None;
                    filled.deposit(&request.slot);
                }
                None => thread::sleep(idle),
            }
        }

        // Never leave a consumer waiting on a request that will not be served.
        if let Some(request) = lock(&inbox).take() {
            let mut outbox = lock(&request.slot.outbox);
            outbox.pending = false;
            request.slot.ready.notify_all();
        }
    }

    fn fill(request: &FillRequest, counters: &Counters) -> Filled {
        let mut batch = VecDeque::with_capacity(request.limit.min(4096));
        let mut eof = false;
        let mut error = None;
        {
            let mut source = lock(&request.source);
            while batch.len() < request.limit {
                match source.parse_call() {
                    Ok(Some(call)) => batch.push_back(call),
                    Ok(None) => {
                        eof = true;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(consumer = request.slot.id, "trace decode failed: {}", e);
                        error = Some(e);
                        eof = true;
                        break;
                    }
                }
            }
        }

        let produced = batch.len() as u64;
        counters.batches.fetch_add(1, Ordering::Relaxed);
        counters
            .calls_produced
            .fetch_add(produced, Ordering::Relaxed);
        tracing::trace!(consumer = request.slot.id, produced, eof, "batch filled");

        Filled { batch, eof, error }
    }

    fn reclaimer_worker(
        retired: Arc<SegQueue<CallRef>>,
        shutdown: Arc<AtomicBool>,
        counters: Arc<Counters>,
        idle: Duration,
    ) {
        const BATCH_SIZE: usize = 1024;

        loop {
            let stopping = shutdown.load(Ordering::SeqCst);

            let mut freed = 0u64;
            while let Some(call) = retired.pop() {
                drop(call);
                freed += 1;
                if freed as usize >= BATCH_SIZE && !stopping {
                    break;
                }
            }
            if freed > 0 {
                counters.calls_reclaimed.fetch_add(freed, Ordering::Relaxed);
            }

            if stopping {
                break;
            }
            if freed == 0 {
                thread::sleep(idle);
            }
        }
    }
}

impl Default for Prefetcher {
    fn default() -> Self {
        Self::new(PrefetchConfig::default())
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            let _ = handle.join();
        }
    }
}
