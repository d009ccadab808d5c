use thiserror::Error;

use crate::broker::DeliveryTag;

/// Broker-level failures. These are fatal to the consumer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker {broker} is unreachable: {source}")]
    Unreachable {
        broker: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("invalid broker configuration: {0}")]
    Misconfigured(String),

    #[error("connection to broker {broker} lost: {source}")]
    Lost {
        broker: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ConnectionError {
    pub fn unreachable(broker: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ConnectionError::Unreachable {
            broker: broker.into(),
            source: source.into(),
        }
    }

    pub fn lost(broker: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ConnectionError::Lost {
            broker: broker.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("message {tag} is not a text message ({len} byte binary body)")]
pub struct PayloadError {
    pub tag: DeliveryTag,
    pub len: usize,
}

#[derive(Debug, Error)]
#[error("failed to report message body: {0}")]
pub struct SinkError(#[from] pub std::io::Error);

/// Per-message failures. None of these stop the receive loop.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("failed to acknowledge message {tag}: {source}")]
    Acknowledge {
        tag: DeliveryTag,
        #[source]
        source: anyhow::Error,
    },
}
