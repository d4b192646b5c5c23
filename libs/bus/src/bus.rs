//! Bus interface.
//!
//! The bus abstracts the publish/subscribe transport that carries points
//! between nodes and the store:
//! - Fire-and-forget publish
//! - Request/reply on a unique inbox subject
//! - Wildcard subscriptions delivered through a bounded queue

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::subject;

/// A message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,

    /// Subject the receiver should answer on, for requests.
    pub reply: Option<String>,

    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
        }
    }

    /// Builds the reply to this message, if the sender asked for one.
    pub fn response(&self, payload: impl Into<Bytes>) -> Option<Message> {
        self.reply
            .as_ref()
            .map(|reply| Message::new(reply.clone(), payload))
    }
}

/// An active subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<Message>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription over a receiver; `on_unsubscribe` runs once.
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::Receiver<Message>,
        on_unsubscribe: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message. Returns `None` once unsubscribed or the
    /// bus is closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stops delivery. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(f) = self.on_unsubscribe.take() {
            f();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.on_unsubscribe.is_some())
            .finish()
    }
}

/// Publish/subscribe transport shared by every manager and client.
///
/// Implementations must be safe to use from many tasks at once without
/// external locking.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish a message.
    async fn publish(&self, msg: Message) -> Result<(), TransportError>;

    /// Subscribe to a subject or wildcard pattern.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    /// Publish `payload` and wait up to `timeout` for a single reply.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let inbox = subject::new_inbox();
        let mut sub = self.subscribe(&inbox).await?;

        self.publish(Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            payload,
        })
        .await?;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }
}
