//! Internal Event Broker
//!
//! In-process, topic based publish/subscribe used by every producer and
//! consumer in the service.
//!
//! ## Semantics
//!
//! - Topics exist once somebody subscribed; publishing to an unknown topic
//!   returns [`BrokerError::TopicNotFound`].
//! - Each subscriber owns a bounded queue. A full queue never stalls other
//!   subscribers; see [`OverflowPolicy`].
//! - One publish reaches subscribers in registration order. Concurrent
//!   publishes are not ordered relative to each other.
//! - Unsubscribe and stop close a queue at most once.
//!
//! ## Example
//!
//! ```rust
//! use devicehub::broker::{Broker, BrokerConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker: Broker<String> = Broker::new(BrokerConfig::default());
//! let mut subscription = broker.subscribe("device_messages").unwrap();
//!
//! broker.publish("device_messages", "hello".to_string()).unwrap();
//! let message = subscription.recv().await.unwrap();
//! assert_eq!(message.event, "hello");
//! # }
//! ```

mod engine;
mod error;
mod subscription;

pub use engine::{Broker, BrokerConfig, OverflowPolicy};
pub use error::{BrokerError, BrokerResult};
pub use subscription::{BrokerMessage, Subscription};
