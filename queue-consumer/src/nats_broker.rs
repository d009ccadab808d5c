use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    context::{GetStreamError, GetStreamErrorKind},
    ErrorCode,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::{DeliveryTag, Message, MessageBroker, Payload};
use crate::error::ConnectionError;

/// A JetStream stream consumed through a durable pull consumer. The stream
/// name is the queue name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NatsConnectionInfo {
    pub address: String,
    pub durable: Option<String>,
    /// Only consume subjects matching this filter.
    pub filter_subject: Option<String>,
    /// Subject used when publishing; defaults to the queue name.
    pub subject: Option<String>,
    pub ack_wait_ms: Option<u64>,
}

impl NatsConnectionInfo {
    fn durable(&self) -> String {
        self.durable
            .clone()
            .unwrap_or_else(|| "queue-consumer".to_string())
    }
}

fn stream_lookup_error(queue: &str, address: &str, error: GetStreamError) -> ConnectionError {
    match error.kind() {
        GetStreamErrorKind::JetStream(e) if e.error_code() == ErrorCode::STREAM_NOT_FOUND => {
            ConnectionError::QueueNotFound(queue.to_string())
        }
        GetStreamErrorKind::EmptyName => {
            ConnectionError::Misconfigured("stream name cannot be empty".to_string())
        }
        _ => ConnectionError::unreachable(address, error),
    }
}

pub struct NatsBroker {
    name: String,
    info: NatsConnectionInfo,
    context: Option<jetstream::Context>,
    messages: Option<pull::Stream>,
    in_flight: Option<(DeliveryTag, jetstream::Message)>,
    stream: String,
    next_tag: u64,
}

impl NatsBroker {
    pub fn new(info: NatsConnectionInfo, name: String) -> Self {
        Self {
            name,
            info,
            context: None,
            messages: None,
            in_flight: None,
            stream: String::new(),
            next_tag: 0,
        }
    }

    async fn open(&self) -> Result<jetstream::Context, ConnectionError> {
        let client = async_nats::connect(&self.info.address)
            .await
            .map_err(|e| ConnectionError::unreachable(&self.info.address, e))?;
        info!(broker = %self.name, address = %self.info.address, "Connected to NATS");
        Ok(jetstream::new(client))
    }
}

#[async_trait]
impl MessageBroker for NatsBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, queue: &str) -> Result<(), ConnectionError> {
        let context = self.open().await?;
        let stream = context
            .get_stream(queue)
            .await
            .map_err(|e| stream_lookup_error(queue, &self.info.address, e))?;

        let durable = self.info.durable();
        let mut config = pull::Config {
            durable_name: Some(durable.clone()),
            ack_policy: AckPolicy::Explicit,
            filter_subject: self.info.filter_subject.clone().unwrap_or_default(),
            ..Default::default()
        };
        if let Some(ack_wait_ms) = self.info.ack_wait_ms {
            config.ack_wait = Duration::from_millis(ack_wait_ms);
        }

        let consumer: PullConsumer = stream
            .get_or_create_consumer(&durable, config)
            .await
            .map_err(|e| ConnectionError::Misconfigured(format!("consumer {durable}: {e}")))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| ConnectionError::unreachable(&self.info.address, anyhow!(e)))?;

        info!(stream = queue, durable = %durable, "Subscribed to JetStream stream");
        self.context = Some(context);
        self.messages = Some(messages);
        self.stream = queue.to_string();
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message> {
        let Some(messages) = self.messages.as_mut() else {
            bail!("NATS broker is not subscribed to a stream");
        };
        let message = match messages.next().await {
            Some(message) => message.map_err(|e| anyhow!(e))?,
            None => bail!("JetStream message stream for {} ended", self.stream),
        };

        let attempt = message
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1);
        self.next_tag += 1;
        let tag = DeliveryTag::new(format!("{}-{}", self.stream, self.next_tag));
        debug!(stream = %self.stream, tag = %tag, attempt, "Received JetStream message");

        let result = Message {
            queue: self.stream.clone(),
            payload: Payload::from_wire(message.message.payload.to_vec(), None),
            tag: tag.clone(),
            attempt,
        };
        // an unacknowledged predecessor is left to the server's ack_wait
        self.in_flight = Some((tag, message));
        Ok(result)
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<()> {
        match self.in_flight.take() {
            Some((in_flight, message)) if &in_flight == tag => {
                message.ack().await.map_err(|e| anyhow!(e))?;
                Ok(())
            }
            other => {
                self.in_flight = other;
                bail!("unknown delivery tag {tag}");
            }
        }
    }

    async fn publish(&mut self, queue: &str, payload: Payload) -> Result<()> {
        if self.context.is_none() {
            self.context = Some(self.open().await?);
        }
        let Some(context) = self.context.as_ref() else {
            bail!("NATS connection unavailable");
        };
        let subject = self.info.subject.clone().unwrap_or_else(|| queue.to_string());
        context
            .publish(subject.clone(), payload.as_bytes().to_vec().into())
            .await
            .map_err(|e| anyhow!(e))?
            .await
            .map_err(|e| anyhow!(e))?;
        debug!(subject = %subject, "Published to JetStream");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.in_flight = None;
        self.messages = None;
        self.context = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use async_nats::jetstream::{
        self,
        context::{GetStreamError, GetStreamErrorKind},
    };

    use super::stream_lookup_error;
    use crate::error::ConnectionError;

    fn api_error(err_code: u64, description: &str) -> GetStreamError {
        let error: jetstream::Error = serde_json::from_value(serde_json::json!({
            "code": 404,
            "err_code": err_code,
            "description": description,
        }))
        .unwrap();
        GetStreamErrorKind::JetStream(error).into()
    }

    #[test]
    fn a_missing_stream_is_queue_not_found() {
        let error = stream_lookup_error(
            "OrderQueue",
            "nats://localhost:4222",
            api_error(10059, "stream not found"),
        );
        assert!(matches!(error, ConnectionError::QueueNotFound(q) if q == "OrderQueue"));
    }

    #[test]
    fn other_lookup_failures_are_unreachable() {
        let disabled = stream_lookup_error(
            "OrderQueue",
            "nats://localhost:4222",
            api_error(10039, "jetstream not enabled"),
        );
        assert!(matches!(disabled, ConnectionError::Unreachable { .. }));

        let timed_out = stream_lookup_error(
            "OrderQueue",
            "nats://localhost:4222",
            GetStreamErrorKind::Request.into(),
        );
        assert!(matches!(timed_out, ConnectionError::Unreachable { .. }));
    }
}
