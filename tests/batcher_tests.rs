//! Batching Engine Tests
//!
//! Drives the engine through its public API with recording consumers. Timing sensitive
//! tests run on a paused clock so window boundaries can be asserted exactly.

use async_trait::async_trait;
use horoscoper::core::batcher::{Batch, BatcherConfig, BatchingEngine};
use horoscoper::core::context::RequestContext;
use horoscoper::core::error::AdmissionError;
use horoscoper::core::traits::BatchConsumer;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

#[derive(Debug)]
struct Dispatched {
    at: Instant,
    ids: Vec<Uuid>,
}

/// Records every batch handed to it.
struct RecordingConsumer {
    batches: mpsc::UnboundedSender<Dispatched>,
}

#[async_trait]
impl BatchConsumer for RecordingConsumer {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
        let ids = batch.contexts().iter().map(|c| c.id()).collect();
        let _ = self.batches.send(Dispatched {
            at: Instant::now(),
            ids,
        });
        Ok(())
    }
}

fn recording_engine(
    batch_size: usize,
    window_ms: u64,
) -> (BatchingEngine, mpsc::UnboundedReceiver<Dispatched>) {
    let (batches, received) = mpsc::unbounded_channel();
    let engine = BatchingEngine::new(
        BatcherConfig::new(batch_size, Duration::from_millis(window_ms)),
        Arc::new(RecordingConsumer { batches }),
    );
    (engine, received)
}

fn contexts(n: usize) -> Vec<RequestContext> {
    (0..n)
        .map(|i| RequestContext::new(format!("prompt {i}"), 64).unwrap())
        .collect()
}

fn ids(contexts: &[RequestContext]) -> Vec<Uuid> {
    contexts.iter().map(|c| c.id()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_flushes_without_waiting_for_window() {
    let (engine, mut batches) = recording_engine(4, 1000);
    engine.start().await;

    let submitted = contexts(4);
    let start = Instant::now();
    for context in submitted.clone() {
        assert_ok!(engine.admit(context).await);
    }

    let batch = batches.recv().await.unwrap();
    assert_eq!(batch.ids, ids(&submitted));
    assert!(batch.at - start < Duration::from_millis(5));

    engine.stop().await;
    assert!(batches.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_flushes_after_window() {
    let (engine, mut batches) = recording_engine(4, 50);
    engine.start().await;

    let submitted = contexts(2);
    let start = Instant::now();
    for context in submitted.clone() {
        assert_ok!(engine.admit(context).await);
    }

    assert_err!(tokio::time::timeout(Duration::from_millis(49), batches.recv()).await);

    let batch = batches.recv().await.unwrap();
    assert_eq!(batch.ids, ids(&submitted));
    let waited = batch.at - start;
    assert!(waited >= Duration::from_millis(50), "flushed after {waited:?}");
    assert!(waited < Duration::from_millis(52), "flushed after {waited:?}");

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_backdated_context_flushes_immediately() {
    let (engine, mut batches) = recording_engine(4, 25);
    engine.start().await;

    let submitted = contexts(3);
    let start = Instant::now();
    let backdated = start - Duration::from_secs(10);
    for context in submitted.clone() {
        assert_ok!(engine.admit_at(context, backdated).await);
    }

    let batch = batches.recv().await.unwrap();
    assert_eq!(batch.ids, ids(&submitted));
    assert!(batch.at - start < Duration::from_millis(5));
    assert_eq!(engine.stats().stale_flushes, 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_head_takes_at_most_batch_size() {
    let (engine, mut batches) = recording_engine(4, 25);
    engine.start().await;

    let submitted = contexts(6);
    let backdated = Instant::now() - Duration::from_secs(10);
    for context in submitted.clone() {
        assert_ok!(engine.admit_at(context, backdated).await);
    }

    let first = batches.recv().await.unwrap();
    let second = batches.recv().await.unwrap();
    assert_eq!(first.ids, ids(&submitted[..4]));
    assert_eq!(second.ids, ids(&submitted[4..]));

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_oldest_contexts_are_batched_first() {
    let (engine, mut batches) = recording_engine(4, 1000);
    engine.start().await;

    let submitted = contexts(10);
    let start = Instant::now();
    for context in submitted.clone() {
        assert_ok!(engine.admit(context).await);
    }

    let mut received = vec![];
    for _ in 0..3 {
        received.push(batches.recv().await.unwrap());
    }

    assert_eq!(received[0].ids, ids(&submitted[0..4]));
    assert_eq!(received[1].ids, ids(&submitted[4..8]));
    assert_eq!(received[2].ids, ids(&submitted[8..]));
    assert!(received[1].at - start < Duration::from_millis(5));
    assert!(received[2].at - start >= Duration::from_millis(1000));

    let stats = engine.stats();
    assert_eq!(stats.admitted, 10);
    assert_eq!(stats.batches_dispatched, 3);
    assert_eq!(stats.stale_flushes, 0);

    engine.stop().await;
}

#[tokio::test]
async fn test_admit_requires_running_engine() {
    let (engine, _batches) = recording_engine(4, 50);
    assert!(!engine.is_running());

    let err = engine.admit(contexts(1).remove(0)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::NotRunning));

    engine.start().await;
    assert!(engine.is_running());
    assert_ok!(engine.admit(contexts(1).remove(0)).await);

    engine.stop().await;
    assert!(!engine.is_running());
    assert_err!(engine.admit(contexts(1).remove(0)).await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_flushes_pending_contexts_without_waiting() {
    let (engine, mut batches) = recording_engine(4, 10_000);
    engine.start().await;

    let submitted = contexts(3);
    for context in submitted.clone() {
        assert_ok!(engine.admit(context).await);
    }

    let start = Instant::now();
    engine.stop().await;
    assert!(start.elapsed() < Duration::from_millis(5));

    let batch = batches.try_recv().unwrap();
    assert_eq!(batch.ids, ids(&submitted));
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent_and_restartable() {
    let (engine, mut batches) = recording_engine(1, 50);

    engine.start().await;
    engine.start().await;
    assert_ok!(engine.admit(contexts(1).remove(0)).await);
    assert_eq!(batches.recv().await.unwrap().ids.len(), 1);
    engine.stop().await;

    engine.start().await;
    assert!(engine.is_running());
    assert_ok!(engine.admit(contexts(1).remove(0)).await);
    assert_eq!(batches.recv().await.unwrap().ids.len(), 1);
    engine.stop().await;

    assert!(batches.try_recv().is_err());
}

/// Fails the first batch, panics on the second and accepts the rest.
struct FlakyConsumer {
    calls: std::sync::atomic::AtomicUsize,
    accepted: mpsc::UnboundedSender<Vec<Uuid>>,
    rejected: mpsc::UnboundedSender<(Vec<Uuid>, String)>,
}

#[async_trait]
impl BatchConsumer for FlakyConsumer {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
        match self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
            0 => anyhow::bail!("no capacity"),
            1 => panic!("consumer blew up"),
            _ => {
                let _ = self.accepted.send(batch.contexts().iter().map(|c| c.id()).collect());
                Ok(())
            }
        }
    }

    async fn reject(&self, batch: &Batch, reason: &str) {
        let ids = batch.contexts().iter().map(|c| c.id()).collect();
        let _ = self.rejected.send((ids, reason.to_owned()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_consumer_failures_are_contained() {
    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    let (rejected_tx, mut rejected) = mpsc::unbounded_channel();
    let engine = BatchingEngine::new(
        BatcherConfig::new(1, Duration::from_millis(10)),
        Arc::new(FlakyConsumer {
            calls: Default::default(),
            accepted: accepted_tx,
            rejected: rejected_tx,
        }),
    );
    engine.start().await;

    let submitted = contexts(3);
    for context in submitted.clone() {
        assert_ok!(engine.admit(context).await);
    }

    let (first, reason) = rejected.recv().await.unwrap();
    assert_eq!(first, ids(&submitted[..1]));
    assert!(reason.contains("no capacity"));

    let (second, reason) = rejected.recv().await.unwrap();
    assert_eq!(second, ids(&submitted[1..2]));
    assert!(reason.contains("consumer blew up"));

    assert_eq!(accepted.recv().await.unwrap(), ids(&submitted[2..]));
    assert!(engine.is_running());

    let stats = engine.stats();
    assert_eq!(stats.consumer_failures, 2);
    assert_eq!(stats.batches_dispatched, 1);

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admits_are_not_lost() {
    let (engine, mut batches) = recording_engine(4, 5);
    let engine = Arc::new(engine);
    engine.start().await;

    let mut producers = vec![];
    for _ in 0..8 {
        let engine = engine.clone();
        producers.push(tokio::spawn(async move {
            let mut admitted = vec![];
            for context in contexts(25) {
                admitted.push(context.id());
                engine.admit(context).await.unwrap();
            }
            admitted
        }));
    }

    let mut expected = HashSet::new();
    for producer in producers {
        expected.extend(producer.await.unwrap());
    }
    engine.stop().await;

    let mut seen = HashSet::new();
    while let Ok(batch) = batches.try_recv() {
        assert!(!batch.ids.is_empty() && batch.ids.len() <= 4);
        for id in batch.ids {
            assert!(seen.insert(id), "context {id} dispatched twice");
        }
    }

    assert_eq!(seen, expected);
    assert_eq!(engine.stats().admitted, 200);
}

/// Signals when a batch arrives and holds it until released.
struct BlockingConsumer {
    entered: mpsc::UnboundedSender<()>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl BatchConsumer for BlockingConsumer {
    async fn consume(&self, _batch: Batch) -> anyhow::Result<()> {
        let _ = self.entered.send(());
        let _permit = self.release.acquire().await?;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_bounded_queue_holds_back_admit() {
    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let engine = BatchingEngine::new(
        BatcherConfig::new(1, Duration::from_millis(10)).with_queue_capacity(Some(1)),
        Arc::new(BlockingConsumer {
            entered: entered_tx,
            release: release.clone(),
        }),
    );
    engine.start().await;

    let mut submitted = contexts(4).into_iter();
    assert_ok!(engine.admit(submitted.next().unwrap()).await);
    entered.recv().await.unwrap();

    // The loop is stuck in the consumer, the queue has room for one more.
    assert_ok!(engine.admit(submitted.next().unwrap()).await);
    assert_err!(
        tokio::time::timeout(
            Duration::from_millis(100),
            engine.admit(submitted.next().unwrap())
        )
        .await
    );

    release.add_permits(1);
    assert_ok!(engine.admit(submitted.next().unwrap()).await);

    engine.stop().await;
}
