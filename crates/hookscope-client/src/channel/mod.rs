//! Message channel client: the broker-facing edge of the pipeline.
//!
//! A [`MessageChannel`] owns the secured connection to the pub/sub broker.
//! `subscribe()` hands out a [`Subscription`]: an asynchronous, cancellable
//! sequence of decoded [`HookEvent`]s. Cancelling (or dropping) it releases
//! the topic and returns the connection to the channel, so the same channel
//! can be subscribed again without reconnecting.
//!
//! ```text
//! ┌──────────────┐  Framed<RespCodec>  ┌──────────────┐  mpsc   ┌──────────────┐
//! │    Broker    │────────────────────▶│ reader task  │────────▶│ Subscription │
//! │ (TLS / TCP)  │◀─── UNSUBSCRIBE ────│ (decode)     │◀─cancel─│  (consumer)  │
//! └──────────────┘                     └──────────────┘         └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Undecodable messages are logged and skipped, never propagated

mod broker;
mod tls;

pub use broker::BrokerClient;
pub use tls::build_tls_config;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hookscope_core::HookEvent;
use hookscope_protocol::RespError;

use crate::config::ChannelConfig;

/// Decoded events buffered between the reader task and the consumer.
pub const SUBSCRIPTION_BUFFER: usize = 256;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the channel client.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connection to {address} timed out after {timeout_secs}s")]
    Timeout { address: String, timeout_secs: u64 },

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Broker rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Broker closed the connection")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("A subscription is already active")]
    AlreadySubscribed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A connection attempt is already in progress")]
    Busy,

    #[error("Reconnection failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] RespError),
}

// ============================================================================
// Channel Trait
// ============================================================================

/// A pub/sub channel delivering hook events.
///
/// Implementations never panic across this boundary: every failure comes
/// back as a [`ChannelError`] and is logged by the caller.
#[async_trait]
pub trait MessageChannel: Send + Sync + 'static {
    /// Establishes (or re-establishes) the broker connection.
    async fn connect(&self, config: &ChannelConfig) -> Result<(), ChannelError>;

    /// Subscribes to the configured topic.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotConnected` if `connect` has not succeeded
    /// - `ChannelError::AlreadySubscribed` if a live subscription exists
    async fn subscribe(&self) -> Result<Subscription, ChannelError>;

    /// Releases network and TLS resources. Idempotent.
    async fn disconnect(&self);
}

// ============================================================================
// Subscription
// ============================================================================

/// Item yielded by a subscription: an event, or the fault that ended it.
pub type SubscriptionItem = Result<HookEvent, ChannelError>;

/// Consumer half of a topic subscription.
///
/// Yields decoded events in broker-delivery order. An `Err` item is
/// terminal: the producer stops after sending it. Dropping the
/// subscription cancels it.
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<SubscriptionItem>,
    cancel: CancellationToken,
}

/// Producer half of a subscription, held by the channel's reader task.
#[derive(Clone)]
pub struct SubscriptionFeed {
    sender: mpsc::Sender<SubscriptionItem>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Creates a connected feed/subscription pair.
    pub fn channel(topic: impl Into<String>, capacity: usize) -> (SubscriptionFeed, Subscription) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        (
            SubscriptionFeed {
                sender,
                cancel: cancel.clone(),
            },
            Subscription {
                topic: topic.into(),
                receiver,
                cancel,
            },
        )
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once cancelled or after the producer went away.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// Decoded events waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Stops the subscription; the producer unsubscribes from the topic.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SubscriptionFeed {
    /// Delivers one item, waiting for buffer space.
    ///
    /// Returns false if the subscription was cancelled or dropped.
    pub async fn deliver(&self, item: SubscriptionItem) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sender.send(item) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer cancels.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token shared with the consumer's [`Subscription`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hookscope_core::HookCategory;

    fn event(id: &str) -> HookEvent {
        HookEvent::builder(id, HookCategory::Notification, Utc::now()).build()
    }

    #[tokio::test]
    async fn test_subscription_yields_in_order() {
        let (feed, mut sub) = Subscription::channel("hooksdata", 8);
        assert!(feed.deliver(Ok(event("a"))).await);
        assert!(feed.deliver(Ok(event("b"))).await);
        assert_eq!(sub.pending(), 2);

        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(first.id().as_str(), "a");
        assert_eq!(second.id().as_str(), "b");
        assert_eq!(sub.topic(), "hooksdata");
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription_and_stops_feed() {
        let (feed, mut sub) = Subscription::channel("hooksdata", 8);
        sub.cancel();
        assert!(sub.is_cancelled());
        assert!(sub.next().await.is_none());
        assert!(feed.is_cancelled());
        assert!(!feed.deliver(Ok(event("late"))).await);
    }

    #[tokio::test]
    async fn test_drop_cancels_feed() {
        let (feed, sub) = Subscription::channel("hooksdata", 8);
        drop(sub);
        assert!(feed.is_cancelled());
    }

    #[tokio::test]
    async fn test_producer_gone_ends_stream() {
        let (feed, mut sub) = Subscription::channel("hooksdata", 8);
        assert!(feed.deliver(Err(ChannelError::Closed)).await);
        drop(feed);
        assert!(matches!(sub.next().await, Some(Err(ChannelError::Closed))));
        assert!(sub.next().await.is_none());
    }
}
