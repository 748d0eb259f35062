//! Redis pub/sub broker

use crate::core::traits::{Broker, Subscription};
use anyhow::Context;
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{info, warn};
use redis::Client as RedisClient;
use redis::aio::MultiplexedConnection;

/// Publishes over one multiplexed connection; every subscription gets its own connection,
/// which is closed when the subscription is dropped.
pub struct RedisBroker {
    client: RedisClient,
    publisher: MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = RedisClient::open(redis_url)
            .with_context(|| format!("invalid redis url `{redis_url}`"))?;
        let publisher = client
            .get_multiplexed_tokio_connection()
            .await
            .context("failed to connect to redis")?;

        info!("Connected to redis at {redis_url}");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        let connection = self
            .client
            .get_async_connection()
            .await
            .context("failed to open redis pub/sub connection")?;

        let mut pubsub = connection.into_pubsub();
        // Resolves on the server's subscribe confirmation.
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;

        let mut messages = pubsub.into_on_message();
        let payloads = stream! {
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => yield payload,
                    Err(err) => warn!(
                        "Dropping non-text payload on {}: {err}",
                        message.get_channel_name()
                    ),
                }
            }
        };

        Ok(Subscription::new(channel, payloads.boxed()))
    }

    async fn publish(&self, messages: Vec<(String, String)>) -> anyhow::Result<()> {
        let mut pipe = redis::pipe();
        for (channel, payload) in &messages {
            pipe.publish(channel, payload).ignore();
        }

        let mut connection = self.publisher.clone();
        pipe.query_async::<_, ()>(&mut connection)
            .await
            .context("failed to publish to redis")?;

        Ok(())
    }
}
