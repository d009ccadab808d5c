use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{DeliveryTag, Message, MessageBroker, Payload};
use crate::error::ConnectionError;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InMemoryOptions {
    /// How long a delivered message stays hidden before it is handed out again.
    pub visibility_timeout_ms: u64,
    /// Create the subscribed queue on connect instead of requiring it to exist.
    pub declare: bool,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
            declare: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub acknowledged: u64,
}

#[derive(Debug)]
struct Envelope {
    payload: Payload,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    visible_at: Instant,
    /// Subscription the message was last handed to.
    owner: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    acknowledged: u64,
    next_tag: u64,
    next_subscriber: u64,
}

impl QueueState {
    fn take_next(
        &mut self,
        queue: &str,
        owner: u64,
        visibility_timeout: Duration,
    ) -> Option<Message> {
        let now = Instant::now();
        let expired = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.visible_at <= now)
            .min_by_key(|(_, in_flight)| in_flight.visible_at)
            .map(|(tag, _)| tag.clone());

        let mut envelope = match expired {
            Some(tag) => self.in_flight.remove(&tag).map(|in_flight| in_flight.envelope),
            None => self.ready.pop_front(),
        }?;

        envelope.deliveries += 1;
        self.next_tag += 1;
        let tag = DeliveryTag::new(format!("{queue}-{}", self.next_tag));
        let message = Message {
            queue: queue.to_string(),
            payload: envelope.payload.clone(),
            tag: tag.clone(),
            attempt: envelope.deliveries,
        };
        self.in_flight.insert(
            tag,
            InFlight {
                envelope,
                visible_at: now + visibility_timeout,
                owner,
            },
        );
        Some(message)
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight
            .values()
            .map(|in_flight| in_flight.visible_at)
            .min()
    }

    fn subscribe(&mut self) -> u64 {
        self.next_subscriber += 1;
        self.next_subscriber
    }

    fn requeue_in_flight(&mut self, owner: u64) {
        let owned: Vec<DeliveryTag> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.owner == owner)
            .map(|(tag, _)| tag.clone())
            .collect();
        let mut in_flight: Vec<_> = owned
            .iter()
            .filter_map(|tag| self.in_flight.remove(tag))
            .collect();
        in_flight.sort_by_key(|f| std::cmp::Reverse(f.visible_at));
        for f in in_flight {
            self.ready.push_front(f.envelope);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug)]
struct Subscription {
    id: u64,
    name: String,
    queue: Arc<MemoryQueue>,
}

/// Process-local broker. Clones share the same queues, so a clone can
/// publish into a queue another clone is consuming from.
#[derive(Debug)]
pub struct InMemoryBroker {
    name: String,
    options: InMemoryOptions,
    queues: Arc<DashMap<String, Arc<MemoryQueue>>>,
    subscription: Option<Subscription>,
}

impl Clone for InMemoryBroker {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            options: self.options.clone(),
            queues: self.queues.clone(),
            subscription: None,
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("memory".to_string(), InMemoryOptions::default())
    }
}

impl InMemoryBroker {
    pub fn new(name: String, options: InMemoryOptions) -> Self {
        Self {
            name,
            options,
            queues: Default::default(),
            subscription: None,
        }
    }

    pub fn declare_queue(&self, queue: &str) {
        self.queues.entry(queue.to_string()).or_default();
    }

    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        let queue = self.queues.get(queue)?;
        let state = queue.state.lock();
        Some(QueueStats {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            acknowledged: state.acknowledged,
        })
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.options.visibility_timeout_ms)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, queue: &str) -> Result<(), ConnectionError> {
        if self.options.declare {
            self.declare_queue(queue);
        }
        let found = self
            .queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConnectionError::QueueNotFound(queue.to_string()))?;
        let id = found.state.lock().subscribe();
        self.subscription = Some(Subscription {
            id,
            name: queue.to_string(),
            queue: found,
        });
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message> {
        let visibility_timeout = self.visibility_timeout();
        let Subscription { id, name, queue } = self
            .subscription
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not subscribed to a queue", self.name))?;

        loop {
            let notified = queue.notify.notified();
            let next_visible_at = {
                let mut state = queue.state.lock();
                if let Some(message) = state.take_next(name, *id, visibility_timeout) {
                    return Ok(message);
                }
                state.next_visible_at()
            };

            match next_visible_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<()> {
        let Some(Subscription { queue, .. }) = &self.subscription else {
            bail!("{} is not subscribed to a queue", self.name);
        };
        let mut state = queue.state.lock();
        if state.in_flight.remove(tag).is_none() {
            bail!("unknown delivery tag {tag}");
        }
        state.acknowledged += 1;
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: Payload) -> Result<()> {
        let target = self
            .queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("queue {queue} does not exist"))?;
        target.state.lock().ready.push_back(Envelope {
            payload,
            deliveries: 0,
        });
        target.notify.notify_one();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(Subscription { id, queue, .. }) = self.subscription.take() {
            let mut state = queue.state.lock();
            state.requeue_in_flight(id);
            if !state.ready.is_empty() {
                queue.notify.notify_one();
            }
        }
        Ok(())
    }
}
