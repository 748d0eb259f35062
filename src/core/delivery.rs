//! Forwards one context's channel to its caller.
//!
//! A delivery goes through `SUBSCRIBED -> {WAITING <-> FORWARDING} -> end -> CLOSED`, where
//! the end is one of [`DeliveryEnd`]. The subscription is released in every end state.

use crate::core::message::OutMessage;
use crate::core::traits::Subscription;
use async_stream::stream;
use futures_util::Stream;
use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT_ERROR: &str = "Timeout inference";
pub const SUBSCRIPTION_CLOSED_ERROR: &str = "Result channel closed";
pub const SHUTDOWN_ERROR: &str = "Server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEnd {
    TerminalReceived,
    TimedOut,
    /// The caller went away and the delivery was dropped.
    Disconnected,
    SubscriptionClosed,
    ShutDown,
}

impl DeliveryEnd {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryEnd::TerminalReceived => "TERMINAL_RECEIVED",
            DeliveryEnd::TimedOut => "TIMED_OUT",
            DeliveryEnd::Disconnected => "DISCONNECTED",
            DeliveryEnd::SubscriptionClosed => "SUBSCRIPTION_CLOSED",
            DeliveryEnd::ShutDown => "SHUT_DOWN",
        }
    }
}

/// Logs how a delivery ended. A delivery dropped before reaching an end was disconnected.
struct EndLog {
    channel: String,
    end: Option<DeliveryEnd>,
}

impl Drop for EndLog {
    fn drop(&mut self) {
        let end = self.end.unwrap_or(DeliveryEnd::Disconnected);
        match end {
            DeliveryEnd::TerminalReceived => {
                debug!("Delivery on {} ended: {}", self.channel, end.as_str())
            }
            _ => info!("Delivery on {} ended: {}", self.channel, end.as_str()),
        }
    }
}

/// Streams the messages of `subscription` until one of them is terminal.
///
/// Waiting for a message is bounded by `ttl`. If it runs out, the transport closes the
/// subscription or `shutdown` is cancelled, an `ERROR` message is yielded as the last item,
/// so the caller always sees a terminal message. Dropping the stream (caller disconnect) ends
/// it silently. Payloads that are not valid [`OutMessage`]s are skipped.
pub fn deliver(
    mut subscription: Subscription,
    ttl: Duration,
    shutdown: CancellationToken,
) -> impl Stream<Item = OutMessage> + Send + 'static {
    stream! {
        let mut end_log = EndLog {
            channel: subscription.channel().to_owned(),
            end: None,
        };

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = tokio::time::timeout(ttl, subscription.next_message()) => Some(next),
            };

            let Some(next) = next else {
                yield OutMessage::error(SHUTDOWN_ERROR);
                break DeliveryEnd::ShutDown;
            };

            let payload = match next {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    yield OutMessage::error(SUBSCRIPTION_CLOSED_ERROR);
                    break DeliveryEnd::SubscriptionClosed;
                }
                Err(_) => {
                    yield OutMessage::error(TIMEOUT_ERROR);
                    break DeliveryEnd::TimedOut;
                }
            };

            match OutMessage::from_json(&payload) {
                Ok(message) => {
                    let terminal = message.is_terminal();
                    yield message;
                    if terminal {
                        break DeliveryEnd::TerminalReceived;
                    }
                }
                Err(err) => warn!("Skipping message on {}: {err}", subscription.channel()),
            }
        };

        end_log.end = Some(end);
    }
}
