use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeReasonCode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{DeliveryTag, Message, MessageBroker, Payload};
use crate::error::ConnectionError;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MqttCredentials {
    username: String,
    password: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConnectionInfo {
    pub address: String,
    /// Fixed client id. With one set the session is persistent, so QoS 1
    /// messages left unacknowledged are redelivered on the next connect.
    pub id: Option<String>,
    pub keep_alive: Option<f32>,
    pub credentials: Option<MqttCredentials>,
    /// Consume through a shared subscription so several workers split the topic.
    pub group: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

impl MqttConnectionInfo {
    pub fn connect(&self) -> Result<(AsyncClient, EventLoop), ConnectionError> {
        let id = match &self.id {
            Some(id) => id.clone(),
            None => ulid::Ulid::new().to_string(),
        };
        let url = format!("{}?client_id={id}", self.address);
        let mut options = MqttOptions::parse_url(url)
            .map_err(|e| ConnectionError::Misconfigured(e.to_string()))?;
        options.set_keep_alive(self.keep_alive()?);
        options.set_manual_acks(true);
        options.set_clean_session(self.id.is_none());

        if let Some(MqttCredentials { username, password }) = &self.credentials {
            options.set_credentials(username, password);
        }

        Ok(AsyncClient::new(options, 100))
    }

    /// Zero disables keep alives; otherwise rumqttc wants whole seconds or more.
    fn keep_alive(&self) -> Result<Duration, ConnectionError> {
        let seconds = self.keep_alive.unwrap_or(5.);
        if !(seconds == 0.0 || seconds >= 1.0) {
            return Err(ConnectionError::Misconfigured(format!(
                "keep_alive must be 0 or at least 1 second, got {seconds}"
            )));
        }
        Duration::try_from_secs_f32(seconds)
            .map_err(|e| ConnectionError::Misconfigured(format!("keep_alive {seconds}: {e}")))
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(10_000))
    }
}

/// Queue names use `.` separators and `*` wildcards; MQTT wants `/` and `+`.
fn to_topic(queue: &str) -> String {
    queue.replace('.', "/").replace('*', "+")
}

fn subscription_filter(queue: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("$share/{group}/{}", to_topic(queue)),
        None => to_topic(queue),
    }
}

pub struct MqttBroker {
    name: String,
    info: MqttConnectionInfo,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    in_flight: Option<(DeliveryTag, Publish)>,
    queue: String,
    next_tag: u64,
}

impl MqttBroker {
    pub fn new(info: MqttConnectionInfo, name: String) -> Self {
        Self {
            name,
            info,
            client: None,
            event_loop: None,
            in_flight: None,
            queue: String::new(),
            next_tag: 0,
        }
    }

    async fn subscribe(
        client: &AsyncClient,
        event_loop: &mut EventLoop,
        filter: &str,
        address: &str,
        queue: &str,
    ) -> Result<(), ConnectionError> {
        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| ConnectionError::unreachable(address, e))?;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(ConnectionError::QueueNotFound(queue.to_string()));
                    }
                    return Ok(());
                }
                Ok(event) => debug!(?event, "MQTT event while subscribing"),
                Err(e) => return Err(ConnectionError::unreachable(address, e)),
            }
        }
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        let (client, event_loop) = self.info.connect()?;
        info!(broker = %self.name, address = %self.info.address, "Connecting to MQTT");
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, queue: &str) -> Result<(), ConnectionError> {
        let (client, mut event_loop) = self.info.connect()?;
        let filter = subscription_filter(queue, self.info.group.as_deref());
        let address = self.info.address.clone();

        tokio::time::timeout(
            self.info.connect_timeout(),
            Self::subscribe(&client, &mut event_loop, &filter, &address, queue),
        )
        .await
        .map_err(|e| ConnectionError::unreachable(&address, e))??;

        info!(broker = %self.name, filter = %filter, "Subscribed to MQTT topic");
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.queue = queue.to_string();
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message> {
        let Some(event_loop) = self.event_loop.as_mut() else {
            bail!("MQTT broker is not subscribed to a topic");
        };

        loop {
            match event_loop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    self.next_tag += 1;
                    let tag = DeliveryTag::new(format!("{}-{}", self.queue, self.next_tag));
                    let attempt = if publish.dup { 2 } else { 1 };
                    debug!(topic = %publish.topic, tag = %tag, "Received MQTT message");

                    let message = Message {
                        queue: self.queue.clone(),
                        payload: Payload::from_wire(publish.payload.to_vec(), None),
                        tag: tag.clone(),
                        attempt,
                    };
                    self.in_flight = Some((tag, publish));
                    return Ok(message);
                }
                event => debug!(?event, "MQTT event"),
            }
        }
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<()> {
        let Some(client) = self.client.as_ref() else {
            bail!("MQTT broker is not connected");
        };
        match self.in_flight.take() {
            Some((in_flight, publish)) if &in_flight == tag => {
                // queued here, written by the event loop on its next poll
                client.ack(&publish).await?;
                Ok(())
            }
            other => {
                self.in_flight = other;
                bail!("unknown delivery tag {tag}");
            }
        }
    }

    async fn publish(&mut self, queue: &str, payload: Payload) -> Result<()> {
        if self.client.is_none() {
            self.open().await?;
        }
        let (Some(client), Some(event_loop)) = (self.client.as_ref(), self.event_loop.as_mut())
        else {
            bail!("MQTT connection unavailable");
        };
        let topic = to_topic(queue);
        client
            .publish(
                topic.clone(),
                QoS::AtLeastOnce,
                false,
                payload.as_bytes().to_vec(),
            )
            .await?;

        let confirmed = tokio::time::timeout(self.info.connect_timeout(), async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(anyhow!(e)),
                }
            }
        })
        .await?;
        confirmed?;
        debug!(topic = %topic, "Published to MQTT");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.in_flight = None;
        if let (Some(client), Some(mut event_loop)) = (self.client.take(), self.event_loop.take())
        {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "Failed to request MQTT disconnect");
                return Ok(());
            }
            // drive queued acks and the disconnect out before dropping the loop
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
        }
        Ok(())
    }
}
