//! In-process loopback transport.
//!
//! Fans published messages out to every live subscriber of the subject over
//! bounded mailboxes. Used by tests and single-process deployments; a real
//! deployment puts a broker-backed implementation behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{BusError, BusMessage, MessageBus, Subscription};

/// Mailbox depth per subscriber. A subscriber that falls this far behind
/// starts losing messages, which the at-least-once contract permits.
const MAILBOX_DEPTH: usize = 64;

/// In-process publish/subscribe bus.
#[derive(Default)]
pub struct InProcessBus {
    subjects: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
}

impl InProcessBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, subject: &str, reply_to: Option<&str>, payload: Value) {
        let mut subjects = self.subjects.lock().expect("bus subject table poisoned");
        let Some(senders) = subjects.get_mut(subject) else {
            return;
        };

        senders.retain(|tx| {
            let msg = BusMessage {
                subject: subject.to_string(),
                reply_to: reply_to.map(str::to_string),
                payload: payload.clone(),
            };
            match tx.try_send(msg) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject, "Dropping message for slow subscriber");
                    true
                }
                // Subscription dropped; forget the sender.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if senders.is_empty() {
            subjects.remove(subject);
        }
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        self.deliver(subject, None, payload);
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Value,
        reply_to: &str,
    ) -> Result<(), BusError> {
        self.deliver(subject, Some(reply_to), payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.subjects
            .lock()
            .expect("bus subject table poisoned")
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(subject.to_string(), rx))
    }
}
