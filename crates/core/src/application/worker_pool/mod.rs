// Worker Pool Queue - batch consumer on top of a BaseQueue

pub mod constants;
mod managed;

pub use managed::ManagedQueue;

use crate::application::backoff::{backoff_err, BackoffConfig};
use crate::application::shutdown::ShutdownToken;
use crate::domain::{QueueSettings, QueueType};
use crate::error::{QueueError, Result};
use crate::port::{BaseQueue, Handler, ItemCodec, JsonCodec};
use constants::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lifecycle of a worker-pool queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Created = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
}

impl QueueState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueueState::Created,
            1 => QueueState::Running,
            2 => QueueState::Draining,
            _ => QueueState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Created => "created",
            QueueState::Running => "running",
            QueueState::Draining => "draining",
            QueueState::Closed => "closed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolOptions {
    /// Error-recovery and flush polling backoff
    pub backoff: BackoffConfig,
    /// Longest wait for a batch to fill up
    pub batch_wait: Duration,
    /// Pause before requeueing a batch that was not processed at all
    pub requeue_delay: Duration,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            batch_wait: BATCH_FILL_WAIT,
            requeue_delay: UNHANDLED_REQUEUE_DELAY,
        }
    }
}

/// Named queue consumed by a pool of workers.
///
/// Each worker pops up to `batch_length` items, hands them to the handler
/// and pushes back whatever the handler returns. Delivery is at-least-once.
pub struct WorkerPoolQueue<T> {
    me: Weak<Self>,
    name: String,
    queue_type: QueueType,
    base: Arc<dyn BaseQueue>,
    codec: Arc<dyn ItemCodec<T>>,
    handler: Arc<dyn Handler<T>>,
    batch_length: usize,
    max_workers: AtomicUsize,
    active_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    inflight: AtomicUsize,
    /// Shared by a worker for the whole pop of a batch, exclusive in flush
    pop_gate: RwLock<()>,
    /// Swapped and cancelled by flush to wake blocked pops
    pop_token: Mutex<CancellationToken>,
    state: AtomicU8,
    run_token: CancellationToken,
    hammer_token: CancellationToken,
    stopped: CancellationToken,
    workers: TaskTracker,
    options: WorkerPoolOptions,
}

impl<T> WorkerPoolQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a queue with the JSON codec and default timings
    pub fn new(
        settings: &QueueSettings,
        base: Arc<dyn BaseQueue>,
        handler: Arc<dyn Handler<T>>,
        shutdown: &ShutdownToken,
    ) -> Arc<Self> {
        Self::with_options(
            settings,
            base,
            Arc::new(JsonCodec::new()),
            handler,
            shutdown,
            WorkerPoolOptions::default(),
        )
    }
}

impl<T> WorkerPoolQueue<T>
where
    T: Send + Sync + 'static,
{
    pub fn with_options(
        settings: &QueueSettings,
        base: Arc<dyn BaseQueue>,
        codec: Arc<dyn ItemCodec<T>>,
        handler: Arc<dyn Handler<T>>,
        shutdown: &ShutdownToken,
        options: WorkerPoolOptions,
    ) -> Arc<Self> {
        let run_token = shutdown.shutdown_token().child_token();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: settings.name.clone(),
            queue_type: settings.queue_type,
            base,
            codec,
            handler,
            batch_length: settings.batch_length.max(1),
            max_workers: AtomicUsize::new(settings.max_workers.max(1)),
            active_workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            pop_gate: RwLock::new(()),
            pop_token: Mutex::new(run_token.child_token()),
            state: AtomicU8::new(QueueState::Created as u8),
            run_token,
            hammer_token: shutdown.hammer_token().child_token(),
            stopped: CancellationToken::new(),
            workers: TaskTracker::new(),
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn batch_length(&self) -> usize {
        self.batch_length
    }

    pub fn item_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    pub fn worker_max_number(&self) -> usize {
        self.max_workers.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Enqueue an item.
    ///
    /// Unique queues return `QueueError::AlreadyInQueue` for a duplicate;
    /// callers should treat that as "already scheduled".
    pub async fn push(&self, item: &T) -> Result<()> {
        if self.state() == QueueState::Closed {
            return Err(QueueError::Closed(self.name.clone()));
        }
        let data = self.codec.encode(item)?;
        self.base.push_item(&self.hammer_token, &data).await
    }

    /// Whether `item` is currently queued (unique queues only)
    pub async fn has(&self, item: &T) -> Result<bool> {
        let data = self.codec.encode(item)?;
        self.base.has_item(&data).await
    }

    /// Number of items waiting in the backend
    pub async fn len(&self) -> Result<usize> {
        self.base.len().await
    }

    /// Drop every queued item; used to reset an out-of-sync queue
    pub async fn remove_all_items(&self) -> Result<()> {
        warn!(queue = %self.name, "Removing all items from queue");
        self.base.remove_all().await
    }

    /// Wait until the backend is empty and no batch is in flight.
    ///
    /// Each check runs with pops paused, so an item the backend already
    /// handed out is always counted as in flight.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        backoff_err(&self.hammer_token, self.options.backoff, Some(deadline), || async {
            if self.state() == QueueState::Closed {
                return Err(QueueError::Closed(self.name.clone()));
            }
            let _paused = tokio::time::timeout_at(deadline, self.pause_pops())
                .await
                .map_err(|_| QueueError::DeadlineExceeded)?;
            let pending = self.base.len().await?;
            Ok(pending > 0 || self.inflight.load(Ordering::SeqCst) > 0)
        })
        .await
    }

    /// Take the pop gate exclusively, waking blocked pops until it is ours
    async fn pause_pops(&self) -> RwLockWriteGuard<'_, ()> {
        let gate = self.pop_gate.write();
        tokio::pin!(gate);
        loop {
            tokio::select! {
                biased;
                guard = &mut gate => return guard,
                _ = async {
                    self.interrupt_pops();
                    sleep(IDLE_SLEEP_DURATION).await
                } => {}
            }
        }
    }

    fn interrupt_pops(&self) {
        let fresh = self.run_token.child_token();
        let old = std::mem::replace(
            &mut *self.pop_token.lock().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        old.cancel();
    }

    fn current_pop_token(&self) -> CancellationToken {
        self.pop_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the worker limit; a running queue scales immediately
    pub fn set_worker_max_number(&self, max: usize) {
        let max = max.max(1);
        let old = self.max_workers.swap(max, Ordering::SeqCst);
        info!(queue = %self.name, old, new = max, "Queue worker limit changed");

        if self.state() != QueueState::Running {
            return;
        }
        let active = self.active_workers.load(Ordering::SeqCst);
        for _ in active..max {
            self.spawn_worker();
        }
    }

    /// Run until the shutdown token is cancelled, then drain and close
    pub async fn run(self: Arc<Self>) {
        let started = self.state.compare_exchange(
            QueueState::Created as u8,
            QueueState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if started.is_err() {
            warn!(queue = %self.name, state = %self.state(), "Queue already started or closed");
            return;
        }

        let workers = self.worker_max_number();
        info!(
            queue = %self.name,
            queue_type = %self.queue_type,
            workers,
            batch_length = self.batch_length,
            "Queue started"
        );
        for _ in 0..workers {
            self.spawn_worker();
        }

        self.run_token.cancelled().await;
        self.state
            .store(QueueState::Draining as u8, Ordering::SeqCst);
        info!(queue = %self.name, inflight = self.inflight.load(Ordering::SeqCst), "Queue draining");

        self.workers.close();
        tokio::select! {
            _ = self.workers.wait() => {
                debug!(queue = %self.name, "All workers stopped");
            }
            _ = self.hammer_token.cancelled() => {
                warn!(
                    queue = %self.name,
                    inflight = self.inflight.load(Ordering::SeqCst),
                    "Hammer fired, abandoning in-flight batches"
                );
            }
        }

        self.close_backend().await;
    }

    /// Cancel this queue and wait up to `timeout` for it to drain.
    ///
    /// In-flight work is abandoned (hammer) once the timeout elapses.
    pub async fn shutdown_wait(&self, timeout: Duration) -> Result<()> {
        self.run_token.cancel();

        let never_ran = self.state.compare_exchange(
            QueueState::Created as u8,
            QueueState::Closed as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if never_ran.is_ok() {
            self.close_backend().await;
            return Ok(());
        }

        tokio::select! {
            _ = self.stopped.cancelled() => return Ok(()),
            _ = sleep(timeout) => {}
        }

        warn!(queue = %self.name, timeout_ms = timeout.as_millis() as u64, "Queue did not drain in time");
        self.hammer_token.cancel();
        tokio::time::timeout(timeout, self.stopped.cancelled())
            .await
            .map_err(|_| QueueError::DeadlineExceeded)
    }

    async fn close_backend(&self) {
        if let Err(e) = self.base.close().await {
            error!(queue = %self.name, error = %e, "Failed to close queue backend");
        }
        self.state.store(QueueState::Closed as u8, Ordering::SeqCst);
        self.stopped.cancel();
        info!(queue = %self.name, "Queue stopped");
    }

    fn spawn_worker(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        self.workers.spawn(me.worker_loop(id));
    }

    /// Give up this worker's slot if the pool is above its limit
    fn try_retire(&self) -> bool {
        let max = self.max_workers.load(Ordering::SeqCst);
        self.active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active > max).then(|| active - 1)
            })
            .is_ok()
    }

    async fn worker_loop(self: Arc<Self>, id: usize) {
        debug!(queue = %self.name, worker = id, "Worker started");
        let mut failures: u32 = 0;

        loop {
            if self.run_token.is_cancelled() {
                break;
            }
            if self.try_retire() {
                debug!(queue = %self.name, worker = id, "Worker retired");
                return;
            }

            match self.next_batch().await {
                Ok(Some(batch)) => {
                    failures = 0;
                    self.handle_batch(batch).await;
                    self.inflight.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(None) => {
                    // non-blocking backend with nothing to give
                    tokio::select! {
                        _ = sleep(IDLE_SLEEP_DURATION) => {}
                        _ = self.run_token.cancelled() => break,
                    }
                }
                // woken by flush, not by shutdown
                Err(QueueError::Cancelled) if !self.run_token.is_cancelled() => continue,
                Err(e) if e.is_cancellation() => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.options.backoff.delay_for(failures);
                    error!(
                        queue = %self.name,
                        worker = id,
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to pop from queue"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.run_token.cancelled() => break,
                    }
                }
            }
        }

        self.active_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(queue = %self.name, worker = id, "Worker stopped");
    }

    /// Pop one item (blocking), then fill the batch until it is full or
    /// the fill wait elapses
    async fn next_batch(&self) -> Result<Option<Vec<Vec<u8>>>> {
        let _popping = self.pop_gate.read().await;
        let pop_token = self.current_pop_token();
        let Some(first) = self.base.pop_item(&pop_token).await? else {
            return Ok(None);
        };
        self.inflight.fetch_add(1, Ordering::SeqCst);

        let mut batch = vec![first];
        if self.batch_length > 1 {
            let fill = pop_token.child_token();
            let timer = fill.clone();
            let wait = self.options.batch_wait;
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(wait) => timer.cancel(),
                    _ = timer.cancelled() => {}
                }
            });

            while batch.len() < self.batch_length {
                match self.base.pop_item(&fill).await {
                    Ok(Some(data)) => batch.push(data),
                    Ok(None) => break,
                    Err(e) => {
                        if !e.is_cancellation() {
                            warn!(queue = %self.name, error = %e, "Failed to fill batch, handing over partial batch");
                        }
                        break;
                    }
                }
            }
            fill.cancel();
        }
        Ok(Some(batch))
    }

    async fn handle_batch(&self, raw: Vec<Vec<u8>>) {
        let mut items = Vec::with_capacity(raw.len());
        let mut kept = Vec::with_capacity(raw.len());
        for data in raw {
            match self.codec.decode(&data) {
                Ok(item) => {
                    items.push(item);
                    kept.push(data);
                }
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Failed to decode queue item, dropping it");
                }
            }
        }
        if items.is_empty() {
            return;
        }
        let total = items.len();

        // Handler runs in its own task so a panic cannot take the worker down
        let handler = Arc::clone(&self.handler);
        let requeue = match tokio::spawn(async move { handler.handle(items).await }).await {
            Ok(unhandled) => {
                let mut encoded = Vec::with_capacity(unhandled.len());
                for item in &unhandled {
                    match self.codec.encode(item) {
                        Ok(data) => encoded.push(data),
                        Err(e) => {
                            error!(queue = %self.name, error = %e, "Failed to encode unhandled item, dropping it");
                        }
                    }
                }
                encoded
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    let panic_msg = panic_message(join_err.into_panic());
                    error!(
                        queue = %self.name,
                        count = total,
                        panic_msg = %panic_msg,
                        "Queue handler panicked, requeueing batch"
                    );
                } else {
                    error!(queue = %self.name, count = total, "Queue handler was cancelled, requeueing batch");
                }
                kept
            }
        };

        if requeue.is_empty() {
            return;
        }
        if requeue.len() == total && !self.options.requeue_delay.is_zero() {
            error!(
                queue = %self.name,
                count = total,
                delay_ms = self.options.requeue_delay.as_millis() as u64,
                "Queue failed to handle batch, backing off before requeue"
            );
            tokio::select! {
                _ = sleep(self.options.requeue_delay) => {}
                _ = self.run_token.cancelled() => {}
            }
        } else {
            debug!(queue = %self.name, count = requeue.len(), total, "Requeueing unhandled items");
        }

        for data in &requeue {
            self.requeue(data).await;
        }
    }

    /// Push an unhandled item back; bounded by the backend's push deadline
    /// rather than by shutdown so a hammer does not discard it
    async fn requeue(&self, data: &[u8]) {
        match self.base.push_item(&CancellationToken::new(), data).await {
            Ok(()) => {}
            Err(QueueError::AlreadyInQueue) => {
                debug!(queue = %self.name, "Unhandled item was queued again by a producer");
            }
            Err(e) => {
                error!(queue = %self.name, error = %e, "Failed to requeue unhandled item");
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
