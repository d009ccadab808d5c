use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::ConnectionError;

/// Opaque handle a broker hands out with every delivery attempt. Passing it
/// back to [`MessageBroker::acknowledge`] settles that attempt.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Classifies a wire body. A declared content type decides; without one
    /// any valid UTF-8 body counts as text.
    pub fn from_wire(body: Vec<u8>, content_type: Option<&str>) -> Self {
        match content_type {
            Some(content_type) if !is_text_type(content_type) => Payload::Binary(body),
            _ => match String::from_utf8(body) {
                Ok(text) => Payload::Text(text),
                Err(e) => Payload::Binary(e.into_bytes()),
            },
        }
    }

    /// The content type published alongside the body by brokers that carry one.
    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text/plain",
            Payload::Binary(_) => "application/octet-stream",
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_text_type(content_type: &str) -> bool {
    content_type
        .get(..5)
        .map_or(false, |kind| kind.eq_ignore_ascii_case("text/"))
}

#[derive(Clone, Debug)]
pub struct Message {
    pub queue: String,
    pub payload: Payload,
    pub tag: DeliveryTag,
    /// 1 on first delivery, incremented on every redelivery the broker reports.
    pub attempt: u32,
}

#[async_trait]
pub trait MessageBroker: Send {
    fn name(&self) -> &str;

    /// Connects and subscribes to `queue`. Only one subscription per broker
    /// instance.
    async fn connect(&mut self, queue: &str) -> Result<(), ConnectionError>;

    /// Waits for the next message on the subscribed queue. Any error is a
    /// lost connection.
    async fn receive(&mut self) -> Result<Message>;

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<()>;

    async fn publish(&mut self, queue: &str, payload: Payload) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    async fn publish_all(&mut self, queue: &str, payloads: Vec<Payload>) -> Result<()> {
        for payload in payloads.into_iter() {
            self.publish(queue, payload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Payload;

    #[test]
    fn utf8_bodies_without_a_content_type_are_text() {
        let payload = Payload::from_wire(b"order-123".to_vec(), None);
        assert_eq!(payload, Payload::Text("order-123".to_string()));
    }

    #[test]
    fn invalid_utf8_bodies_are_binary() {
        let payload = Payload::from_wire(vec![0xff, 0xfe, 0x00], None);
        assert_eq!(payload, Payload::Binary(vec![0xff, 0xfe, 0x00]));
    }

    #[test]
    fn a_binary_content_type_wins_over_utf8_bodies() {
        let payload = Payload::from_wire(b"abc".to_vec(), Some("application/octet-stream"));
        assert_eq!(payload, Payload::Binary(b"abc".to_vec()));

        let payload = Payload::from_wire(b"abc".to_vec(), Some("text/plain; charset=utf-8"));
        assert_eq!(payload, Payload::Text("abc".to_string()));
    }

    #[test]
    fn content_types_match_regardless_of_case() {
        let payload = Payload::from_wire(b"abc".to_vec(), Some("Text/Plain"));
        assert_eq!(payload, Payload::Text("abc".to_string()));

        let payload = Payload::from_wire(b"abc".to_vec(), Some("TEXT/CSV"));
        assert_eq!(payload, Payload::Text("abc".to_string()));
    }
}
