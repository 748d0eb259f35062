//! Micro-batching admission control.
//!
//! Contexts admitted by any number of request handlers are queued in arrival order and grouped
//! into batches by a single background loop. A batch is flushed as soon as it holds
//! `batch_size` contexts, or once its oldest member has waited `window` since it was admitted.
//! If the loop only gets to a context after its window has already passed, it takes whatever
//! else is queued right now (up to `batch_size`) and flushes without waiting.

use crate::core::context::RequestContext;
use crate::core::error::AdmissionError;
use crate::core::traits::BatchConsumer;
use futures_util::FutureExt;
use log::{debug, error, info};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Max contexts per batch, at least 1.
    pub batch_size: usize,
    /// Max time a context waits once it is the oldest member of a forming batch.
    pub window: Duration,
    /// `None` for an unbounded queue. With `Some(n)`, `admit` waits while `n` contexts are queued.
    pub queue_capacity: Option<usize>,
}

impl BatcherConfig {
    pub fn new(batch_size: usize, window: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            window,
            queue_capacity: None,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity.map(|c| c.max(1));
        self
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig::new(4, Duration::from_millis(250))
    }
}

/// Contexts flushed together, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    contexts: Vec<RequestContext>,
}

impl Batch {
    pub fn new(contexts: Vec<RequestContext>) -> Self {
        Self { contexts }
    }

    pub fn contexts(&self) -> &[RequestContext] {
        &self.contexts
    }

    pub fn into_contexts(self) -> Vec<RequestContext> {
        self.contexts
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Counters exposed through the health endpoint.
#[derive(Debug, Default)]
pub struct EngineStats {
    admitted: AtomicU64,
    batches_dispatched: AtomicU64,
    stale_flushes: AtomicU64,
    consumer_failures: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub batches_dispatched: u64,
    pub stale_flushes: u64,
    pub consumer_failures: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            stale_flushes: self.stale_flushes.load(Ordering::Relaxed),
            consumer_failures: self.consumer_failures.load(Ordering::Relaxed),
        }
    }
}

struct Pending {
    enqueued_at: Instant,
    context: RequestContext,
}

#[derive(Clone)]
enum QueueSender {
    Bounded(mpsc::Sender<Pending>),
    Unbounded(mpsc::UnboundedSender<Pending>),
}

impl QueueSender {
    /// Fails only once the receiving loop is gone.
    async fn send(&self, pending: Pending) -> Result<(), AdmissionError> {
        let sent = match self {
            QueueSender::Bounded(sender) => sender.send(pending).await.is_ok(),
            QueueSender::Unbounded(sender) => sender.send(pending).is_ok(),
        };

        if sent {
            Ok(())
        } else {
            Err(AdmissionError::NotRunning)
        }
    }
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<Pending>),
    Unbounded(mpsc::UnboundedReceiver<Pending>),
}

impl QueueReceiver {
    /// `None` once every sender is dropped and the queue is drained.
    async fn recv(&mut self) -> Option<Pending> {
        match self {
            QueueReceiver::Bounded(receiver) => receiver.recv().await,
            QueueReceiver::Unbounded(receiver) => receiver.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<Pending> {
        match self {
            QueueReceiver::Bounded(receiver) => receiver.try_recv().ok(),
            QueueReceiver::Unbounded(receiver) => receiver.try_recv().ok(),
        }
    }
}

fn queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (sender, receiver) = mpsc::channel(capacity.max(1));
            (QueueSender::Bounded(sender), QueueReceiver::Bounded(receiver))
        }
        None => {
            let (sender, receiver) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(sender), QueueReceiver::Unbounded(receiver))
        }
    }
}

/// Groups admitted contexts into batches and hands them to a [`BatchConsumer`].
///
/// The engine is constructed explicitly and owned by whoever serves requests. `admit` can be
/// called concurrently from any number of tasks; batch formation happens on one background
/// loop started by [`BatchingEngine::start`].
pub struct BatchingEngine {
    config: BatcherConfig,
    consumer: Arc<dyn BatchConsumer>,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
    sender: std::sync::Mutex<Option<QueueSender>>,
    // Held across start/stop so a concurrent `stop` only returns once the loop is gone.
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchingEngine {
    pub fn new(config: BatcherConfig, consumer: Arc<dyn BatchConsumer>) -> Self {
        Self {
            config,
            consumer,
            stats: Arc::new(EngineStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            sender: std::sync::Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawns the batching loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let (sender, receiver) = queue(self.config.queue_capacity);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        self.running.store(true, Ordering::SeqCst);

        *worker = Some(tokio::spawn(batching_loop(
            receiver,
            self.config.clone(),
            self.consumer.clone(),
            self.stats.clone(),
            self.running.clone(),
        )));
    }

    /// Stops accepting contexts and waits for the loop to exit.
    ///
    /// Contexts already queued are still flushed, without waiting out their window.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;

        self.running.store(false, Ordering::SeqCst);
        // Dropping the last sender closes the queue, the loop drains it and returns.
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(handle) = worker.take() {
            if let Err(err) = handle.await {
                error!("Batching loop terminated abnormally: {err}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues `context` for the next batch, stamped with the current time.
    pub async fn admit(&self, context: RequestContext) -> Result<(), AdmissionError> {
        self.admit_at(context, Instant::now()).await
    }

    /// Queues `context` as if it had arrived at `enqueued_at`.
    ///
    /// The window of a batch is measured from this timestamp, so a context stamped further in
    /// the past than `window` is flushed on the next scheduling opportunity.
    pub async fn admit_at(
        &self,
        context: RequestContext,
        enqueued_at: Instant,
    ) -> Result<(), AdmissionError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AdmissionError::NotRunning)?;

        debug!("Adding context {} to batch", context.id());
        sender
            .send(Pending {
                enqueued_at,
                context,
            })
            .await?;

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct FormedBatch {
    batch: Batch,
    stale: bool,
}

async fn batching_loop(
    mut queue: QueueReceiver,
    config: BatcherConfig,
    consumer: Arc<dyn BatchConsumer>,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
) {
    info!(
        "Batching loop started: batch_size={}, window={:?}",
        config.batch_size, config.window
    );

    while let Some(formed) = fill_batch(&mut queue, config.batch_size, config.window).await {
        if formed.stale {
            stats.stale_flushes.fetch_add(1, Ordering::Relaxed);
        }
        dispatch(consumer.as_ref(), &stats, formed.batch).await;
    }

    running.store(false, Ordering::SeqCst);
    info!("Batching loop stopped");
}

/// Collects the next batch. Returns `None` once the queue is closed and empty.
async fn fill_batch(
    queue: &mut QueueReceiver,
    batch_size: usize,
    window: Duration,
) -> Option<FormedBatch> {
    // Nothing pending, wait for as long as it takes.
    let head = queue.recv().await?;

    let now = Instant::now();
    let deadline = head.enqueued_at + window;
    let waited = now.saturating_duration_since(head.enqueued_at);

    let mut contexts = Vec::with_capacity(batch_size);
    contexts.push(head.context);

    if deadline <= now {
        while contexts.len() < batch_size {
            match queue.try_recv() {
                Some(pending) => contexts.push(pending.context),
                None => break,
            }
        }

        debug!(
            "Queue head waited {waited:?}, past the window; flushing {} contexts",
            contexts.len()
        );
        return Some(FormedBatch {
            batch: Batch::new(contexts),
            stale: true,
        });
    }

    while contexts.len() < batch_size {
        match timeout_at(deadline, queue.recv()).await {
            Ok(Some(pending)) => contexts.push(pending.context),
            // Closed, or the oldest member's window is over.
            Ok(None) | Err(_) => break,
        }
    }

    Some(FormedBatch {
        batch: Batch::new(contexts),
        stale: false,
    })
}

async fn dispatch(consumer: &dyn BatchConsumer, stats: &EngineStats, batch: Batch) {
    info!("Dispatching batch of {} contexts", batch.len());

    let outcome = AssertUnwindSafe(consumer.consume(batch.clone()))
        .catch_unwind()
        .await;

    let reason = match outcome {
        Ok(Ok(())) => {
            stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => format!("batch consumer panicked: {}", panic_message(&*panic)),
    };

    stats.consumer_failures.fetch_add(1, Ordering::Relaxed);
    error!(
        "Failed to hand off batch of {} contexts: {reason}",
        batch.len()
    );

    if AssertUnwindSafe(consumer.reject(&batch, &reason))
        .catch_unwind()
        .await
        .is_err()
    {
        error!("Batch consumer panicked while rejecting a batch");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
