//! Event-publishing sinks.
//!
//! Every execution context carries an [`EventSink`]. Handlers publish
//! follow-up events through it without knowing which broker, if any, sits
//! behind it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::PublishError;

/// An event emitted through a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub name: String,
    pub payload: Value,
}

/// Outbound event channel for one context.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, name: &str, payload: Value) -> Result<(), PublishError>;
}

/// Type alias for a shared sink handle.
pub type BoxedSink = Arc<dyn EventSink>;

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn publish(&self, name: &str, _payload: Value) -> Result<(), PublishError> {
        trace!(event = name, "Dropping event published to no-op sink");
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PublishedEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that observes it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, name: &str, payload: Value) -> Result<(), PublishError> {
        self.tx
            .send(PublishedEvent {
                name: name.to_string(),
                payload,
            })
            .map_err(|_| PublishError::Closed {
                event: name.to_string(),
            })
    }
}
