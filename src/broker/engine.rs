//! Topic registry and fan-out

use dashmap::DashMap;
use prometheus::IntCounterVec;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::error::{BrokerError, BrokerResult};
use super::subscription::{BrokerMessage, Subscription, Subscriptor};

/// What happens when a subscriber's queue is full at publish time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the message for that subscriber only and count the drop
    #[default]
    DropNewest,
    /// Park the message in the subscriber's backlog and let its forwarding
    /// task wait for room in the queue
    ///
    /// Publishes still return immediately and each subscriber sees messages
    /// in publish order. Once the backlog is full too, further messages are
    /// dropped and counted as under `DropNewest`.
    Block,
}

/// Broker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Capacity of each subscriber's delivery queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Messages parked per subscriber under `OverflowPolicy::Block`
    #[serde(default = "default_block_backlog")]
    pub block_backlog: usize,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_block_backlog() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            block_backlog: default_block_backlog(),
        }
    }
}

type SubscriptorList<E> = Arc<Vec<Arc<Subscriptor<E>>>>;

/// In-process topic based publish/subscribe broker
///
/// Topics come into existence on the first `subscribe`. Each topic maps to
/// an immutable list of subscriptors that is replaced wholesale when a new
/// subscriber joins, so publishers can iterate a snapshot without holding
/// any lock.
///
/// A message published while a subscriber is being removed may be dropped
/// for that subscriber. Delivery is at most once.
pub struct Broker<E> {
    topics: DashMap<String, SubscriptorList<E>>,
    config: BrokerConfig,
    dropped: Option<IntCounterVec>,
}

impl<E> Broker<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create a broker
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            topics: DashMap::new(),
            config,
            dropped: None,
        }
    }

    /// Count dropped messages on the given counter (labelled by topic)
    pub fn with_drop_counter(mut self, counter: IntCounterVec) -> Self {
        self.dropped = Some(counter);
        self
    }

    /// Register a new subscriber on `topic`, creating the topic if needed
    ///
    /// Under `OverflowPolicy::Block` this starts the subscriber's forwarding
    /// task and fails with [`BrokerError::NoRuntime`] outside a Tokio runtime.
    pub fn subscribe(&self, topic: &str) -> BrokerResult<Subscription<E>> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = Uuid::new_v4().to_string();
        let closed = CancellationToken::new();

        let sender = match self.config.overflow {
            OverflowPolicy::DropNewest => tx,
            OverflowPolicy::Block => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;
                let (intake_tx, intake_rx) = mpsc::channel(self.config.block_backlog.max(1));
                let span = tracing::debug_span!("broker.forward", topic = %topic, subscription_id = %id);
                runtime.spawn(forward(intake_rx, tx, closed.clone()).instrument(span));
                intake_tx
            }
        };
        let subscriptor = Arc::new(Subscriptor::new(id.clone(), sender, closed));

        // The entry guard holds the shard lock, so concurrent subscribers
        // to the same topic append one after another.
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let mut next = Vec::with_capacity(entry.len() + 1);
        next.extend(entry.iter().cloned());
        next.push(subscriptor);
        *entry = Arc::new(next);
        drop(entry);

        tracing::debug!(topic = %topic, subscription_id = %id, "Subscribed");
        Ok(Subscription::new(id, rx))
    }

    /// Close a subscription
    ///
    /// Unsubscribing an already closed subscription succeeds.
    pub fn unsubscribe(&self, topic: &str, subscription_id: &str) -> BrokerResult<()> {
        let subscriptors = self.snapshot(topic)?;

        let subscriptor = subscriptors
            .iter()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| BrokerError::SubscriptorNotFound {
                topic: topic.to_string(),
                id: subscription_id.to_string(),
            })?;

        if subscriptor.close() {
            tracing::debug!(topic = %topic, subscription_id = %subscription_id, "Unsubscribed");
        }
        Ok(())
    }

    /// Publish an event to every active subscriber of `topic`
    ///
    /// Never waits: returns as soon as the message has been handed to each
    /// subscriber's queue, or its backlog under `OverflowPolicy::Block`.
    pub fn publish(&self, topic: &str, event: E) -> BrokerResult<()> {
        self.publish_message(topic, BrokerMessage::new(event))
    }

    /// Publish a prepared message
    pub fn publish_message(&self, topic: &str, message: BrokerMessage<E>) -> BrokerResult<()> {
        let subscriptors = self.snapshot(topic)?;
        self.deliver_or_drop(topic, &subscriptors, message);
        Ok(())
    }

    fn deliver_or_drop(
        &self,
        topic: &str,
        subscriptors: &[Arc<Subscriptor<E>>],
        message: BrokerMessage<E>,
    ) {
        let _guard = message.span.enter();
        for subscriptor in subscriptors {
            let Some(sender) = subscriptor.sender() else {
                continue;
            };
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        topic = %topic,
                        subscription_id = %subscriptor.id,
                        "Subscriber queue full, dropping message"
                    );
                    if let Some(counter) = &self.dropped {
                        counter.with_label_values(&[topic]).inc();
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        topic = %topic,
                        subscription_id = %subscriptor.id,
                        "Subscriber gone, skipping"
                    );
                }
            }
        }
    }

    /// Close every subscription on every topic
    ///
    /// Safe to call more than once.
    pub fn stop(&self) {
        let mut closed = 0usize;
        for entry in self.topics.iter() {
            for subscriptor in entry.value().iter() {
                if subscriptor.close() {
                    closed += 1;
                }
            }
        }
        tracing::info!(closed_subscriptions = closed, "Broker stopped");
    }

    /// Names of all topics that have ever been subscribed to
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of active subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|e| e.value().iter().filter(|s| s.is_active()).count())
            .unwrap_or(0)
    }

    fn snapshot(&self, topic: &str) -> BrokerResult<SubscriptorList<E>> {
        self.topics
            .get(topic)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }
}

/// Move one subscriber's backlog into its queue, waiting for room
///
/// Stops when the subscription is closed or the receiver is dropped; the
/// queue sender goes with it, which ends the subscriber's `recv`.
async fn forward<E>(
    mut backlog: mpsc::Receiver<BrokerMessage<E>>,
    queue: mpsc::Sender<BrokerMessage<E>>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            message = backlog.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            sent = queue.send(message) => {
                if sent.is_err() {
                    tracing::debug!("Subscriber gone, stopping forwarder");
                    break;
                }
            }
        }
    }
}
