use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use redis::{aio::Connection, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{DeliveryTag, Message, MessageBroker, Payload};
use crate::error::ConnectionError;

const BODY_FIELD: &str = "body";
const CONTENT_TYPE_FIELD: &str = "content_type";

/// A Redis stream consumed through a consumer group. The stream is the queue.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConnectionInfo {
    pub address: String,
    pub group: Option<String>,
    pub consumer: Option<String>,
    /// Pending entries idle for longer than this are claimed and redelivered.
    pub visibility_timeout_ms: Option<u64>,
}

impl RedisConnectionInfo {
    fn group(&self) -> String {
        self.group
            .clone()
            .unwrap_or_else(|| "queue-consumer".to_string())
    }

    fn consumer(&self) -> String {
        self.consumer
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string())
    }

    fn visibility_timeout_ms(&self) -> u64 {
        self.visibility_timeout_ms.unwrap_or(30_000)
    }
}

#[derive(Debug, PartialEq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    fn into_message(mut self, stream: &str, attempt: u32) -> Message {
        let content_type = self
            .fields
            .remove(CONTENT_TYPE_FIELD)
            .and_then(|v| String::from_utf8(v).ok());
        let payload = match self.fields.remove(BODY_FIELD) {
            Some(body) => Payload::from_wire(body, content_type.as_deref()),
            None => Payload::Binary(Vec::new()),
        };
        Message {
            queue: stream.to_string(),
            payload,
            tag: DeliveryTag::new(self.id),
            attempt,
        }
    }
}

fn bulk(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Bulk(items) => Ok(items),
        Value::Nil => Ok(Vec::new()),
        other => bail!("unexpected redis reply {other:?}"),
    }
}

/// `[id, [field, value, ...]]`, or nil for an entry deleted while pending.
fn parse_entry(value: Value) -> Result<Option<StreamEntry>> {
    if value == Value::Nil {
        return Ok(None);
    }
    let mut parts = bulk(value)?.into_iter();
    let (Some(id), Some(fields)) = (parts.next(), parts.next()) else {
        bail!("malformed stream entry");
    };
    let id: String = redis::from_redis_value(&id)?;
    if fields == Value::Nil {
        return Ok(None);
    }

    let mut map = HashMap::new();
    let mut fields = bulk(fields)?.into_iter();
    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
        map.insert(
            redis::from_redis_value::<String>(&key)?,
            redis::from_redis_value::<Vec<u8>>(&value)?,
        );
    }
    Ok(Some(StreamEntry { id, fields: map }))
}

/// XREADGROUP: `[[stream, [entry, ...]], ...]` or nil when the block timed out.
fn parse_read_reply(value: Value) -> Result<Vec<StreamEntry>> {
    let mut entries = Vec::new();
    for stream in bulk(value)? {
        let mut parts = bulk(stream)?.into_iter();
        let Some(stream_entries) = parts.nth(1) else {
            bail!("malformed XREADGROUP reply");
        };
        for entry in bulk(stream_entries)? {
            entries.extend(parse_entry(entry)?);
        }
    }
    Ok(entries)
}

/// XAUTOCLAIM: `[next_start, [entry, ...], [deleted_id, ...]]`.
fn parse_autoclaim_reply(value: Value) -> Result<Vec<StreamEntry>> {
    let mut parts = bulk(value)?.into_iter();
    let Some(claimed) = parts.nth(1) else {
        bail!("malformed XAUTOCLAIM reply");
    };
    let mut entries = Vec::new();
    for entry in bulk(claimed)? {
        entries.extend(parse_entry(entry)?);
    }
    Ok(entries)
}

/// XPENDING extended form: `[[id, consumer, idle_ms, deliveries], ...]`.
fn parse_delivery_count(value: Value) -> Result<Option<u32>> {
    let Some(first) = bulk(value)?.into_iter().next() else {
        return Ok(None);
    };
    let summary = bulk(first)?;
    let count = summary
        .get(3)
        .ok_or_else(|| anyhow!("malformed XPENDING reply"))?;
    Ok(Some(redis::from_redis_value(count)?))
}

/// XPENDING for a single consumer: an empty reply means nothing is left to claim.
fn has_no_pending(value: Value) -> Result<bool> {
    Ok(bulk(value)?.is_empty())
}

pub struct RedisBroker {
    name: String,
    info: RedisConnectionInfo,
    group: String,
    consumer: String,
    connection: Option<Connection>,
    stream: Option<String>,
}

impl RedisBroker {
    pub fn new(info: RedisConnectionInfo, name: String) -> Self {
        let group = info.group();
        let consumer = info.consumer();
        Self {
            name,
            info,
            group,
            consumer,
            connection: None,
            stream: None,
        }
    }

    async fn open(&self) -> Result<Connection, ConnectionError> {
        let client = redis::Client::open(self.info.address.as_str())
            .map_err(|e| ConnectionError::Misconfigured(e.to_string()))?;
        let connection = client
            .get_tokio_connection()
            .await
            .map_err(|e| ConnectionError::unreachable(&self.info.address, e))?;
        info!(broker = %self.name, address = %self.info.address, "Connected to redis");
        Ok(connection)
    }

    /// Generated consumer names are never reused, so drop the consumer from
    /// the group once it holds no pending entries.
    async fn remove_idle_consumer(
        connection: &mut Connection,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool> {
        let pending: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(1)
            .arg(consumer)
            .query_async(connection)
            .await?;
        if !has_no_pending(pending)? {
            return Ok(false);
        }
        redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async::<_, i64>(connection)
            .await?;
        Ok(true)
    }

    async fn claim_idle(
        connection: &mut Connection,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Option<Message>> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(connection)
            .await?;
        let Some(entry) = parse_autoclaim_reply(reply)?.into_iter().next() else {
            return Ok(None);
        };

        let pending: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(&entry.id)
            .arg(&entry.id)
            .arg(1)
            .query_async(connection)
            .await?;
        let attempt = parse_delivery_count(pending)?.unwrap_or(2);
        debug!(stream, id = %entry.id, attempt, "Claimed idle pending entry");
        Ok(Some(entry.into_message(stream, attempt)))
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, queue: &str) -> Result<(), ConnectionError> {
        let mut connection = self.open().await?;
        let address = self.info.address.clone();

        let exists: bool = redis::cmd("EXISTS")
            .arg(queue)
            .query_async(&mut connection)
            .await
            .map_err(|e| ConnectionError::unreachable(&address, e))?;
        if !exists {
            return Err(ConnectionError::QueueNotFound(queue.to_string()));
        }

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.group)
            .arg("0")
            .query_async(&mut connection)
            .await;
        match created {
            Ok(()) => info!(stream = queue, group = %self.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) if e.code() == Some("WRONGTYPE") => {
                return Err(ConnectionError::Misconfigured(format!(
                    "redis key {queue} is not a stream"
                )))
            }
            Err(e) => return Err(ConnectionError::unreachable(&address, e)),
        }

        info!(stream = queue, group = %self.group, consumer = %self.consumer, "Subscribed to redis stream");
        self.connection = Some(connection);
        self.stream = Some(queue.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message> {
        let Self {
            info,
            group,
            consumer,
            connection,
            stream,
            ..
        } = self;
        let (Some(connection), Some(stream)) = (connection.as_mut(), stream.as_deref()) else {
            bail!("redis broker is not subscribed to a stream");
        };
        let visibility_timeout_ms = info.visibility_timeout_ms();

        loop {
            if let Some(message) =
                Self::claim_idle(connection, stream, &*group, &*consumer, visibility_timeout_ms)
                    .await?
            {
                return Ok(message);
            }

            // Bounded block so idle pending entries get claimed while the stream is quiet.
            let reply: Value = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&*group)
                .arg(&*consumer)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(visibility_timeout_ms.max(1))
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query_async(connection)
                .await?;
            if let Some(entry) = parse_read_reply(reply)?.into_iter().next() {
                return Ok(entry.into_message(stream, 1));
            }
        }
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<()> {
        let (Some(connection), Some(stream)) = (self.connection.as_mut(), self.stream.as_deref())
        else {
            bail!("redis broker is not subscribed to a stream");
        };
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.group)
            .arg(tag.as_str())
            .query_async(connection)
            .await?;
        if acked == 0 {
            bail!("entry {tag} is not pending for group {}", self.group);
        }
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: Payload) -> Result<()> {
        if self.connection.is_none() {
            self.connection = Some(self.open().await?);
        }
        let Some(connection) = self.connection.as_mut() else {
            bail!("redis connection unavailable");
        };
        let id: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(payload.as_bytes())
            .arg(CONTENT_TYPE_FIELD)
            .arg(payload.content_type())
            .query_async(connection)
            .await?;
        debug!(stream = queue, id = %id, "Published to redis stream");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let (connection, stream) = (self.connection.take(), self.stream.take());
        if let (Some(mut connection), Some(stream)) = (connection, stream) {
            if self.info.consumer.is_none() {
                match Self::remove_idle_consumer(
                    &mut connection,
                    &stream,
                    &self.group,
                    &self.consumer,
                )
                .await
                {
                    Ok(true) => {
                        debug!(stream = %stream, consumer = %self.consumer, "Removed consumer from group")
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, consumer = %self.consumer, "Failed to remove consumer from group")
                    }
                }
            }
        }
        Ok(())
    }
}
