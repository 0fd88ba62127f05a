//! Metric workers declared in configuration
//!
//! ```toml
//! [[metric_workers]]
//! name = "soil_temperature"
//! kind = "gauge"
//! topic = "device_messages"
//! event = "uplink"
//! value_path = "decoded_payload.temperature.0.value"
//!
//! [metric_workers.labels]
//! device_id = "device_id"
//! ```
//!
//! Paths are dotted and resolved against the JSON form of the event
//! payload. Numeric segments index into arrays.

use async_trait::async_trait;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use super::runner::Consumer;
use crate::broker::BrokerMessage;
use crate::events::{topics, Event};
use crate::telemetry::Metrics;

/// One `[[metric_workers]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricWorkerConfig {
    pub name: String,
    /// "counter", "gauge" or "histogram"
    pub kind: String,
    pub topic: String,
    /// Only events with this name are recorded; all events when unset
    #[serde(default)]
    pub event: Option<String>,
    /// Path of the recorded value; counters ignore it and add one
    #[serde(default)]
    pub value_path: Option<String>,
    /// Label name to payload path
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("Unsupported metric kind: {0}")]
    UnsupportedKind(String),

    #[error("Unknown topic {topic} for metric {name}")]
    UnknownTopic { name: String, topic: String },

    #[error("Metric {0} needs a value_path")]
    MissingValuePath(String),

    #[error("Registering metric failed: {0}")]
    Registration(#[from] prometheus::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "histogram" => Ok(MetricKind::Histogram),
            other => Err(MetricError::UnsupportedKind(other.to_string())),
        }
    }
}

enum Instrument {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

/// Records one configured metric from one topic
pub struct MetricWorker {
    name: String,
    topic: &'static str,
    event: Option<String>,
    value_path: Option<String>,
    label_paths: Vec<String>,
    instrument: Instrument,
}

impl MetricWorker {
    /// Validate `config` and register its instrument into `metrics`
    pub fn new(config: &MetricWorkerConfig, metrics: &Metrics) -> Result<Self, MetricError> {
        let kind: MetricKind = config.kind.parse()?;
        let topic = topics::resolve(&config.topic).ok_or_else(|| MetricError::UnknownTopic {
            name: config.name.clone(),
            topic: config.topic.clone(),
        })?;
        if kind != MetricKind::Counter && config.value_path.is_none() {
            return Err(MetricError::MissingValuePath(config.name.clone()));
        }

        let label_names: Vec<&str> = config.labels.keys().map(String::as_str).collect();
        let help = format!("Configured {} from {}", config.kind, config.topic);
        let registry = metrics.registry();

        let instrument = match kind {
            MetricKind::Counter => {
                let counter = CounterVec::new(Opts::new(config.name.as_str(), help), &label_names)?;
                registry.register(Box::new(counter.clone()))?;
                Instrument::Counter(counter)
            }
            MetricKind::Gauge => {
                let gauge = GaugeVec::new(Opts::new(config.name.as_str(), help), &label_names)?;
                registry.register(Box::new(gauge.clone()))?;
                Instrument::Gauge(gauge)
            }
            MetricKind::Histogram => {
                let histogram =
                    HistogramVec::new(HistogramOpts::new(config.name.as_str(), help), &label_names)?;
                registry.register(Box::new(histogram.clone()))?;
                Instrument::Histogram(histogram)
            }
        };

        Ok(Self {
            name: config.name.clone(),
            topic,
            event: config.event.clone(),
            value_path: config.value_path.clone(),
            label_paths: config.labels.values().cloned().collect(),
            instrument,
        })
    }

    /// Record `event` if it matches; returns whether anything was recorded
    pub fn record(&self, event: &Event) -> bool {
        if self.event.as_deref().is_some_and(|wanted| wanted != event.name()) {
            return false;
        }

        let json = match serde_json::to_value(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(metric = %self.name, error = %e, "Event not serializable");
                return false;
            }
        };
        let payload = json.get("value").unwrap_or(&Value::Null);

        let label_values: Vec<String> = self
            .label_paths
            .iter()
            .map(|path| extract(payload, path).and_then(label_value).unwrap_or_default())
            .collect();
        let labels: Vec<&str> = label_values.iter().map(String::as_str).collect();

        match &self.instrument {
            Instrument::Counter(counter) => {
                counter.with_label_values(&labels).inc();
                true
            }
            Instrument::Gauge(gauge) => match self.value(payload) {
                Some(value) => {
                    gauge.with_label_values(&labels).set(value);
                    true
                }
                None => false,
            },
            Instrument::Histogram(histogram) => match self.value(payload) {
                Some(value) => {
                    histogram.with_label_values(&labels).observe(value);
                    true
                }
                None => false,
            },
        }
    }

    fn value(&self, payload: &Value) -> Option<f64> {
        let path = self.value_path.as_deref()?;
        let value = extract(payload, path).and_then(numeric_value);
        if value.is_none() {
            tracing::debug!(metric = %self.name, path = %path, "No numeric value at path");
        }
        value
    }
}

/// Resolve a dotted path inside a JSON value
pub(crate) fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn label_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Consumer for MetricWorker {
    type Event = Event;

    fn name(&self) -> &'static str {
        "metric_worker"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![self.topic]
    }

    async fn on_message(self: Arc<Self>, _topic: &'static str, message: BrokerMessage<Event>) {
        self.record(&message.event);
    }
}

/// Builds every configured metric worker
pub struct MetricWorkerFactory {
    metrics: Arc<Metrics>,
}

impl MetricWorkerFactory {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// Fails on the first invalid entry
    pub fn create_workers(&self, configs: &[MetricWorkerConfig]) -> Result<Vec<MetricWorker>, MetricError> {
        configs
            .iter()
            .map(|config| {
                tracing::info!(
                    name = %config.name,
                    kind = %config.kind,
                    topic = %config.topic,
                    "Creating metric worker"
                );
                MetricWorker::new(config, &self.metrics).inspect_err(|e| {
                    tracing::error!(name = %config.name, error = %e, "Creating metric worker failed");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SensorReading, Uplink};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn uplink(device_id: &str, temperature: f64) -> Event {
        let mut payload = HashMap::new();
        payload.insert(
            "temperature".to_string(),
            vec![SensorReading { index: 0, value: temperature }],
        );
        Event::Uplink(Uplink {
            device_id: device_id.to_string(),
            dev_eui: String::new(),
            received_at: Utc::now(),
            port: 2,
            decoded_payload: payload,
            correlation_ids: Vec::new(),
        })
    }

    fn config(name: &str, kind: &str) -> MetricWorkerConfig {
        MetricWorkerConfig {
            name: name.to_string(),
            kind: kind.to_string(),
            topic: "device_messages".to_string(),
            event: Some("uplink".to_string()),
            value_path: Some("decoded_payload.temperature.0.value".to_string()),
            labels: BTreeMap::from([("device_id".to_string(), "device_id".to_string())]),
        }
    }

    #[test]
    fn test_extract_path() {
        let value = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(extract(&value, "a.b.0"), Some(&json!(10)));
        assert_eq!(extract(&value, "a.b.1.c"), Some(&json!("x")));
        assert_eq!(extract(&value, "a.b.7"), None);
        assert_eq!(extract(&value, "a.missing"), None);
    }

    #[test]
    fn test_gauge_records_extracted_value() {
        let metrics = Metrics::new().unwrap();
        let worker = MetricWorker::new(&config("soil_temperature", "gauge"), &metrics).unwrap();

        assert!(worker.record(&uplink("dev-1", 18.25)));

        let text = metrics.encode().unwrap();
        assert!(text.contains("devicehub_soil_temperature{device_id=\"dev-1\"} 18.25"));
    }

    #[test]
    fn test_event_filter() {
        let metrics = Metrics::new().unwrap();
        let mut cfg = config("uplinks_seen", "counter");
        cfg.event = Some("command_sent".to_string());
        let worker = MetricWorker::new(&cfg, &metrics).unwrap();

        assert!(!worker.record(&uplink("dev-1", 1.0)));
    }

    #[test]
    fn test_histogram_observes() {
        let metrics = Metrics::new().unwrap();
        let worker = MetricWorker::new(&config("temperature_distribution", "histogram"), &metrics).unwrap();

        worker.record(&uplink("dev-1", 10.0));
        worker.record(&uplink("dev-1", 20.0));

        let text = metrics.encode().unwrap();
        assert!(text.contains("devicehub_temperature_distribution_count{device_id=\"dev-1\"} 2"));
    }

    #[test]
    fn test_factory_rejects_unsupported_kind() {
        let factory = MetricWorkerFactory::new(Arc::new(Metrics::new().unwrap()));
        let result = factory.create_workers(&[config("ok", "counter"), config("bad", "summary")]);
        assert!(matches!(result, Err(MetricError::UnsupportedKind(kind)) if kind == "summary"));
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let metrics = Metrics::new().unwrap();
        let mut cfg = config("x", "counter");
        cfg.topic = "weather".to_string();
        assert!(matches!(
            MetricWorker::new(&cfg, &metrics),
            Err(MetricError::UnknownTopic { .. })
        ));
    }

    #[test]
    fn test_gauge_requires_value_path() {
        let metrics = Metrics::new().unwrap();
        let mut cfg = config("x", "gauge");
        cfg.value_path = None;
        assert!(matches!(
            MetricWorker::new(&cfg, &metrics),
            Err(MetricError::MissingValuePath(_))
        ));
    }
}
