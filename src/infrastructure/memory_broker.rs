//! In-process pub/sub broker

use crate::core::traits::{Broker, Subscription};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::trace;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Pub/sub over tokio channels, for single-process deployments and tests.
///
/// Every subscriber of a channel gets its own queue. Publishing a group holds the broker lock
/// for the whole group, so concurrent publishers never interleave within a channel's group.
#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|subscribers| subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_owned())
            .or_default()
            .push(sender);

        let messages = stream! {
            while let Some(payload) = receiver.recv().await {
                yield payload;
            }
        };

        Ok(Subscription::new(channel, messages.boxed()))
    }

    async fn publish(&self, messages: Vec<(String, String)>) -> anyhow::Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);

        for (channel, payload) in messages {
            let Some(subscribers) = channels.get_mut(&channel) else {
                trace!("No subscribers on {channel}, dropping message");
                continue;
            };

            subscribers.retain(|subscriber| subscriber.send(payload.clone()).is_ok());
            if subscribers.is_empty() {
                channels.remove(&channel);
            }
        }

        Ok(())
    }
}
