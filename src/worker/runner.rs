//! Generic consumer loop
//!
//! One select loop shared by every background worker: subscribe, then
//! multiplex cancellation, an optional ticker and the subscribed topics,
//! handing each tick or message to a tracked task.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::broker::{Broker, BrokerMessage};

/// Lifecycle of a consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Initializing => "initializing",
            LoopState::Running => "running",
            LoopState::Draining => "draining",
            LoopState::Terminated => "terminated",
        }
    }
}

/// A component driven by [`ConsumerLoop`]
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Event type of the broker this consumer reads from
    type Event: Clone + Send + Sync + 'static;

    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Topics to subscribe to before running
    fn topics(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Period of `on_tick`, `None` for message-only consumers
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_tick(self: Arc<Self>) {}

    async fn on_message(self: Arc<Self>, _topic: &'static str, _message: BrokerMessage<Self::Event>) {}

    /// Cancel the token passed to [`ConsumerLoop::run`] to stop a consumer.
    /// This hook only logs.
    fn shutdown(&self) {
        tracing::warn!(worker = self.name(), "Shutdown is not implemented, cancel the run token instead");
    }
}

/// Options shared by all consumer loops
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Handlers allowed to run at once; the loop waits for a free slot
    /// before taking the next tick or message
    pub max_in_flight: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

/// Runs `done` when dropped, so every exit path signals completion
struct DoneGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            done();
        }
    }
}

/// Select loop with tracked, bounded handler tasks
pub struct ConsumerLoop<C: Consumer> {
    consumer: Arc<C>,
    broker: Arc<Broker<C::Event>>,
    options: LoopOptions,
    state: watch::Sender<LoopState>,
}

impl<C: Consumer> ConsumerLoop<C> {
    pub fn new(consumer: Arc<C>, broker: Arc<Broker<C::Event>>, options: LoopOptions) -> Self {
        let (state, _) = watch::channel(LoopState::Initializing);
        Self {
            consumer,
            broker,
            options,
            state,
        }
    }

    /// Watch the loop's lifecycle
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Run until `cancel` fires, then wait for in-flight handlers and call `done`
    pub async fn run<F>(self, cancel: CancellationToken, done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _done = DoneGuard(Some(Box::new(done)));
        let name = self.consumer.name();

        let topics = self.consumer.topics();
        let mut streams = StreamMap::new();
        let mut subscriptions: Vec<(&'static str, String)> = Vec::new();
        for &topic in &topics {
            match self.broker.subscribe(topic) {
                Ok(subscription) => {
                    let (id, stream) = subscription.into_stream();
                    subscriptions.push((topic, id));
                    streams.insert(topic, stream);
                }
                Err(e) => {
                    tracing::error!(worker = name, topic = %topic, error = %e, "Subscribe failed, worker not started");
                    self.unsubscribe_all(&subscriptions);
                    self.set_state(LoopState::Terminated);
                    return;
                }
            }
        }

        let mut ticker = self.consumer.tick_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.options.max_in_flight.max(1)));

        self.set_state(LoopState::Running);
        tracing::info!(worker = name, topics = ?topics, "Worker running");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut ticker) => {
                    let Some(permit) = acquire(&permits, &cancel).await else { break };
                    let consumer = Arc::clone(&self.consumer);
                    let span = tracing::debug_span!("worker.tick", worker = name);
                    tracker.spawn(
                        async move {
                            consumer.on_tick().await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Some((topic, message)) = streams.next(), if !streams.is_empty() => {
                    let Some(permit) = acquire(&permits, &cancel).await else { break };
                    let consumer = Arc::clone(&self.consumer);
                    let span = tracing::debug_span!(parent: &message.span, "worker.message", worker = name, topic = topic);
                    tracker.spawn(
                        async move {
                            consumer.on_message(topic, message).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
            }
        }

        self.set_state(LoopState::Draining);
        tracing::info!(worker = name, in_flight = tracker.len(), "Worker draining");

        self.unsubscribe_all(&subscriptions);
        tracker.close();
        tracker.wait().await;

        self.set_state(LoopState::Terminated);
        tracing::info!(worker = name, "Worker stopped");
    }

    fn unsubscribe_all(&self, subscriptions: &[(&'static str, String)]) {
        for (topic, id) in subscriptions {
            if let Err(e) = self.broker.unsubscribe(topic, id) {
                tracing::warn!(worker = self.consumer.name(), topic = %topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn acquire(permits: &Arc<Semaphore>, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(permits).acquire_owned() => permit.ok(),
    }
}
