//! Seams between the batching core and its collaborators.

use crate::core::batcher::Batch;
use crate::core::context::RequestContext;
use crate::core::message::ChunkResult;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

/// Receives batches formed by the [`crate::core::batcher::BatchingEngine`].
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    /// Hands a batch off for processing.
    ///
    /// Returns `Err` if the batch could not be taken. The engine never retries a batch.
    async fn consume(&self, batch: Batch) -> anyhow::Result<()>;

    /// Called by the engine after `consume` failed for `batch`.
    ///
    /// Implementations that can reach the callers should end every context in the batch with
    /// an `ERROR` message.
    async fn reject(&self, _batch: &Batch, _reason: &str) {}
}

/// One step of output for a batch: chunks for whichever contexts produced output at that step.
pub type ResultGroup = Vec<ChunkResult>;

/// The model side. Produces output for a whole batch at once.
pub trait InferenceProvider: Send + Sync {
    /// Lazily generates the result groups for `contexts`.
    ///
    /// Every context must eventually get exactly one chunk with `is_last` set, unless the
    /// stream yields an `Err`, after which it is not polled again.
    fn infer_batch(
        &self,
        contexts: Vec<RequestContext>,
    ) -> BoxStream<'static, anyhow::Result<ResultGroup>>;
}

/// Pub/sub transport keyed by channel name.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribes to `channel`. Returns once the subscription is live, so anything published
    /// afterwards is delivered to it.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription>;

    /// Publishes `(channel, payload)` pairs in order as a single group.
    async fn publish(&self, messages: Vec<(String, String)>) -> anyhow::Result<()>;
}

/// A live subscription to one channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, messages: BoxStream<'static, String>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next payload. `None` means the transport closed the subscription.
    pub async fn next_message(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
