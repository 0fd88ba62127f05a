//! Broker error types

use thiserror::Error;

/// Structural errors returned by broker operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Nobody has ever subscribed to the topic
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// The subscription id is not registered under the topic
    #[error("Subscriptor {id} not found in topic {topic}")]
    SubscriptorNotFound { topic: String, id: String },

    /// Blocking delivery needs a Tokio runtime to run its forwarding task
    #[error("Blocking delivery requires a Tokio runtime")]
    NoRuntime,
}

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::TopicNotFound("device_messages".to_string());
        assert_eq!(err.to_string(), "Topic not found: device_messages");

        let err = BrokerError::SubscriptorNotFound {
            topic: "tasks".to_string(),
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Subscriptor abc not found in topic tasks");
    }
}
