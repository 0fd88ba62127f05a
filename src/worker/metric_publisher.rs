//! Built-in metrics derived from broker traffic

use async_trait::async_trait;
use std::sync::Arc;

use super::runner::Consumer;
use crate::broker::BrokerMessage;
use crate::domain::Uplink;
use crate::events::{topics, Event};
use crate::telemetry::Metrics;

/// Records sensor gauges and command/scheduled task counters
pub struct MetricPublisherWorker {
    metrics: Arc<Metrics>,
}

impl MetricPublisherWorker {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    pub fn record(&self, event: &Event) {
        match event {
            Event::Uplink(uplink) => self.record_uplink(uplink),
            Event::CommandSent(command) | Event::CommandProcessed(command) => {
                self.metrics
                    .command_events
                    .with_label_values(&[&command.device_name, event.name()])
                    .inc();
            }
            Event::ScheduledTaskExecuted(execution) => {
                self.metrics
                    .scheduled_task_events
                    .with_label_values(&[&execution.scheduled_task.id])
                    .inc();
            }
            Event::CommandStatusUpdate(_) | Event::TaskCreated(_) => {}
        }
    }

    fn record_uplink(&self, uplink: &Uplink) {
        for (sensor, readings) in &uplink.decoded_payload {
            for reading in readings {
                let index = reading.index.to_string();
                self.metrics
                    .sensor_values
                    .with_label_values(&[&uplink.device_id, sensor, &index])
                    .set(reading.value);
            }
        }
    }
}

#[async_trait]
impl Consumer for MetricPublisherWorker {
    type Event = Event;

    fn name(&self) -> &'static str {
        "metric_publisher"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![
            topics::DEVICE_MESSAGES,
            topics::COMMAND_EVENTS,
            topics::SCHEDULED_TASK_EVENTS,
        ]
    }

    async fn on_message(self: Arc<Self>, _topic: &'static str, message: BrokerMessage<Event>) {
        self.record(&message.event);
    }
}
