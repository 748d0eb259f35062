//! Turns chunk results into [`OutMessage`]s on each context's channel.

use crate::core::context::RequestContext;
use crate::core::message::{ChunkResult, OutMessage};
use crate::core::traits::Broker;
use log::debug;
use std::sync::Arc;

#[derive(Clone)]
pub struct ResultPublisher {
    broker: Arc<dyn Broker>,
}

impl ResultPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publishes the chunks of one processing step as a single group.
    ///
    /// Chunks keep their relative order, so messages on any one channel arrive in the order
    /// they were produced.
    pub async fn publish_step(&self, chunks: &[ChunkResult]) -> anyhow::Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let messages = chunks
            .iter()
            .map(|chunk| (chunk.context.channel(), OutMessage::from(chunk).to_json()))
            .collect();

        debug!("Publishing {} chunks", chunks.len());
        self.broker.publish(messages).await
    }

    /// Ends the stream of every context in `contexts` with an `ERROR` message.
    pub async fn publish_errors<'a>(
        &self,
        contexts: impl IntoIterator<Item = &'a RequestContext>,
        reason: &str,
    ) -> anyhow::Result<()> {
        let payload = OutMessage::error(reason).to_json();
        let messages: Vec<_> = contexts
            .into_iter()
            .map(|context| (context.channel(), payload.clone()))
            .collect();

        if messages.is_empty() {
            return Ok(());
        }

        self.broker.publish(messages).await
    }
}
