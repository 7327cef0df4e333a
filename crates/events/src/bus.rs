//! Event publishing abstraction (mechanics only).
//!
//! The publisher is the **hand-off point** between a committed store mutation and
//! the outbound channel:
//!
//! ```text
//! Company Service → Store (commit) → EventPublisher (publish) → channel → consumers
//! ```
//!
//! ## Delivery Guarantees
//!
//! - `publish()` returning `Ok` means the channel accepted the event into its own
//!   storage. What happens after that is the channel's guarantee.
//! - **At-least-once**: the service may publish the same event more than once
//!   (retries, re-publish after an outage). Consumers deduplicate on
//!   `(subject_id, sequence)`, see [`crate::EventDeduplicator`].
//! - **Per-subject order**: `sequence` is strictly increasing per subject. No
//!   ordering is promised across subjects.
//!
//! ## Thread Safety
//!
//! The trait requires `Send + Sync`; one publisher is shared by all request tasks.

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use async_trait::async_trait;
use thiserror::Error;

use crate::ChangeEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Transient channel failure (connection loss, broker rejected, buffer full).
    #[error("event channel unavailable: {0}")]
    Unavailable(String),

    /// The event could not be encoded for the wire. Retrying will not help.
    #[error("event encoding failed: {0}")]
    Encode(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Unavailable(_))
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        (**self).publish(event).await
    }
}

/// A subscription to an in-process event stream.
///
/// Each subscription gets a copy of every event published after it was created.
/// Designed for single-consumer use (one thread/task drains it).
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}
