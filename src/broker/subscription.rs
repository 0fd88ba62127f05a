//! Subscriptions and the broker-side subscriptor record

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// A message travelling through the broker
///
/// Carries the span that was current at publish time so consumers can
/// attach their handling to the producer's trace.
#[derive(Debug, Clone)]
pub struct BrokerMessage<E> {
    /// Typed event payload
    pub event: E,
    /// Span of the publisher
    pub span: Span,
    /// Optional error annotation set by the producer
    pub error: Option<String>,
}

impl<E> BrokerMessage<E> {
    /// Wrap an event, capturing the current span
    pub fn new(event: E) -> Self {
        Self {
            event,
            span: Span::current(),
            error: None,
        }
    }

    /// Attach an error annotation
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A consumer's registration on a topic
///
/// Owned exclusively by the subscriber. The receive queue ends (`recv`
/// returns `None`) once the broker closes it on unsubscribe or stop.
#[derive(Debug)]
pub struct Subscription<E> {
    id: String,
    receiver: mpsc::Receiver<BrokerMessage<E>>,
}

impl<E> Subscription<E> {
    pub(crate) fn new(id: String, receiver: mpsc::Receiver<BrokerMessage<E>>) -> Self {
        Self { id, receiver }
    }

    /// Unique subscription id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next message; `None` after the subscription is closed
    pub async fn recv(&mut self) -> Option<BrokerMessage<E>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Result<BrokerMessage<E>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Split into the id and a stream of messages
    pub fn into_stream(self) -> (String, ReceiverStream<BrokerMessage<E>>) {
        (self.id, ReceiverStream::new(self.receiver))
    }
}

/// Broker-internal record wrapping one subscription's sending half
///
/// The sender feeds either the subscriber queue directly or, under blocking
/// delivery, the backlog of a forwarding task that watches `closed`.
pub(crate) struct Subscriptor<E> {
    pub(crate) id: String,
    active: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<BrokerMessage<E>>>>,
    closed: CancellationToken,
}

impl<E> Subscriptor<E> {
    pub(crate) fn new(id: String, sender: mpsc::Sender<BrokerMessage<E>>, closed: CancellationToken) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            sender: Mutex::new(Some(sender)),
            closed,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Sender for delivery, `None` once closed
    pub(crate) fn sender(&self) -> Option<mpsc::Sender<BrokerMessage<E>>> {
        if !self.is_active() {
            return None;
        }
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mark inactive and drop the sender. Returns true only for the call
    /// that actually closed the queue.
    pub(crate) fn close(&self) -> bool {
        self.active.store(false, Ordering::Release);
        self.closed.cancel();
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }
}
