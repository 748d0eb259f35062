//! Background inference for formed batches.

use crate::core::batcher::Batch;
use crate::core::publisher::ResultPublisher;
use crate::core::traits::{BatchConsumer, InferenceProvider};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// [`BatchConsumer`] that runs each batch through an [`InferenceProvider`] on its own task and
/// publishes the results.
///
/// At most `concurrency` batches are processed at once. While all slots are taken, `consume`
/// waits, which in turn holds back the batching loop.
pub struct InferenceWorker {
    provider: Arc<dyn InferenceProvider>,
    publisher: ResultPublisher,
    slots: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl InferenceWorker {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        publisher: ResultPublisher,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            publisher,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Refuses new batches and waits for the ones in flight.
    pub async fn shutdown(&self) {
        self.slots.close();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[async_trait]
impl BatchConsumer for InferenceWorker {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .context("inference worker is shut down")?;

        let provider = self.provider.clone();
        let publisher = self.publisher.clone();
        self.tasks.spawn(async move {
            process_batch(provider.as_ref(), &publisher, batch).await;
            drop(slot);
        });

        Ok(())
    }

    async fn reject(&self, batch: &Batch, reason: &str) {
        if let Err(err) = self.publisher.publish_errors(batch.contexts(), reason).await {
            error!("Failed to publish errors for rejected batch: {err:#}");
        }
    }
}

/// Drives inference for one batch to completion.
///
/// Every context in the batch ends up with exactly one terminal message: chunks after a
/// context's terminal are dropped, and contexts the provider leaves unfinished get an
/// `ERROR` message.
pub async fn process_batch(
    provider: &dyn InferenceProvider,
    publisher: &ResultPublisher,
    batch: Batch,
) {
    let started = Instant::now();
    info!("Starting to process batch of {} contexts", batch.len());

    let mut unfinished: HashSet<Uuid> = batch.contexts().iter().map(|c| c.id()).collect();
    let mut failure = None;
    let mut steps = provider.infer_batch(batch.contexts().to_vec());

    while let Some(step) = steps.next().await {
        let group = match step {
            Ok(group) => group,
            Err(err) => {
                failure = Some(format!("inference failed: {err:#}"));
                break;
            }
        };

        let mut chunks = Vec::with_capacity(group.len());
        for chunk in group {
            let id = chunk.context.id();
            if !unfinished.contains(&id) {
                warn!("Dropping chunk for finished or unknown context {id}");
                continue;
            }
            if chunk.is_last {
                unfinished.remove(&id);
            }
            chunks.push(chunk);
        }

        if let Err(err) = publisher.publish_step(&chunks).await {
            failure = Some(format!("failed to publish results: {err:#}"));
            // Terminals of this step may or may not have gone out. A second terminal on a
            // channel is never forwarded, deliveries stop at the first one.
            for chunk in chunks.iter().filter(|c| c.is_last) {
                unfinished.insert(chunk.context.id());
            }
            break;
        }

        if unfinished.is_empty() {
            break;
        }
    }

    if !unfinished.is_empty() {
        let reason = failure.unwrap_or_else(|| "inference ended without a result".to_owned());
        error!(
            "Batch processing failed for {} contexts: {reason}",
            unfinished.len()
        );

        let contexts = batch.contexts().iter().filter(|c| unfinished.contains(&c.id()));
        if let Err(err) = publisher.publish_errors(contexts, &reason).await {
            error!("Failed to publish errors: {err:#}");
        }
    }

    info!(
        "Finished processing batch of {} contexts in {:?}",
        batch.len(),
        started.elapsed()
    );
}
