//! Benchmarks for the event broker and WebSocket message encoding
//!
//! Run with: cargo bench

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use devicehub::broker::BrokerConfig;
use devicehub::domain::{SensorData, SensorReading, Uplink};
use devicehub::events::{topics, Event, EventBroker};
use devicehub::websocket::DeviceMessage;

fn create_uplink(device: usize) -> Event {
    let mut data = SensorData::new();
    data.insert(
        "temperature".to_string(),
        (0..4).map(|index| SensorReading { index, value: 20.0 + index as f64 }).collect(),
    );
    Event::Uplink(Uplink {
        device_id: format!("dev-{}", device),
        dev_eui: String::new(),
        received_at: Utc::now(),
        port: 2,
        decoded_payload: data,
        correlation_ids: Vec::new(),
    })
}

fn bench_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("broker");

    for subscribers in [1, 8, 64] {
        group.throughput(Throughput::Elements(subscribers as u64));

        group.bench_function(format!("fan_out_{}", subscribers), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let broker = EventBroker::new(BrokerConfig {
                        queue_capacity: iters as usize + 1,
                        ..BrokerConfig::default()
                    });
                    let mut subscriptions: Vec<_> = (0..subscribers)
                        .map(|_| broker.subscribe(topics::DEVICE_MESSAGES).unwrap())
                        .collect();
                    let event = create_uplink(0);

                    let start = std::time::Instant::now();

                    for _ in 0..iters {
                        broker.publish(topics::DEVICE_MESSAGES, black_box(event.clone())).unwrap();
                    }
                    for subscription in &mut subscriptions {
                        for _ in 0..iters {
                            subscription.recv().await.unwrap();
                        }
                    }

                    start.elapsed()
                })
            });
        });
    }

    group.bench_function("publish_full_queue", |b| {
        let broker = EventBroker::new(BrokerConfig {
            queue_capacity: 1,
            ..BrokerConfig::default()
        });
        let _subscription = broker.subscribe(topics::DEVICE_MESSAGES).unwrap();
        let event = create_uplink(0);
        broker.publish(topics::DEVICE_MESSAGES, event.clone()).unwrap();

        // Every publish after the first is dropped for the idle subscriber
        b.iter(|| broker.publish(topics::DEVICE_MESSAGES, black_box(event.clone())).unwrap());
    });

    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_message");

    let event = create_uplink(1);

    group.bench_function("from_event_to_text", |b| {
        b.iter(|| {
            DeviceMessage::from_event(black_box(&event))
                .unwrap()
                .to_text()
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_publish, bench_encoding);
criterion_main!(benches);
