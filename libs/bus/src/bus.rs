//! The `MessageBus` trait and subscription types.

use async_trait::async_trait;
use serde_json::Value;
use stagehand_id::InboxId;
use tokio::sync::mpsc;

use crate::BusError;

/// A message as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,

    /// Reply subject, present when the publisher expects responses.
    pub reply_to: Option<String>,

    /// Wire payload.
    pub payload: Value,
}

impl BusMessage {
    /// Decode the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A live subscription to one subject.
///
/// Messages are buffered in a bounded mailbox; dropping the subscription
/// unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Creates a subscription from its mailbox receiver.
    pub fn new(subject: String, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { subject, rx }
    }

    /// Subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message. Returns `None` once the transport is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// A publish/subscribe message transport.
///
/// The transport has no native request/response support; `request` layers it
/// on by subscribing to a fresh inbox subject before publishing. Responders
/// may reply more than once on the same inbox (the staging protocol sends a
/// setup-phase reply followed by a completion-phase reply).
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message with no reply expected. Fire-and-forget,
    /// at-least-once.
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError>;

    /// Publish a message carrying a reply subject.
    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Value,
        reply_to: &str,
    ) -> Result<(), BusError>;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Publish a request and return the subscription its replies arrive on.
    ///
    /// Zero, one, or two replies may arrive; the caller decides how many to
    /// wait for and for how long.
    async fn request(&self, subject: &str, payload: Value) -> Result<Subscription, BusError> {
        let inbox = InboxId::new().to_string();
        let sub = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, payload, &inbox).await?;
        Ok(sub)
    }
}
