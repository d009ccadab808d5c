use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Message, MessageBroker, Payload};
use crate::configs::ConsumerConfig;
use crate::error::{ConnectionError, HandleError, PayloadError};
use crate::sink::ReportSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connected,
    Receiving,
    Processing,
}

/// Requests a running consumer to stop. The request is honoured between
/// messages, never in the middle of one.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receives messages from one queue, one at a time, reporting each text
/// body and acknowledging it only once the report succeeded.
pub struct QueueConsumer<S> {
    config: ConsumerConfig,
    broker: Box<dyn MessageBroker>,
    sink: S,
    state: watch::Sender<ConsumerState>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: ReportSink + 'static> QueueConsumer<S> {
    /// Connects to the broker named in `config` and subscribes to its queue.
    pub async fn start(config: ConsumerConfig, sink: S) -> Result<Self, ConnectionError> {
        let broker = config.broker.build("queue-consumer".to_string());
        Self::with_broker(config, broker, sink).await
    }

    pub async fn with_broker(
        config: ConsumerConfig,
        mut broker: Box<dyn MessageBroker>,
        sink: S,
    ) -> Result<Self, ConnectionError> {
        info!(broker = broker.name(), queue = %config.queue, "Starting queue consumer");
        broker.connect(&config.queue).await?;
        info!(broker = broker.name(), queue = %config.queue, "Queue consumer connected");

        let (state, _) = watch::channel(ConsumerState::Connected);
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            config,
            broker,
            sink,
            state,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Runs the receive loop until a stop is requested or the broker
    /// connection fails. The broker is closed on every exit path.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(queue = %self.config.queue, "Receiving messages");
        let result = self.receive_loop().await;
        if let Err(e) = &result {
            error!(error = %e, "Receive loop terminated");
        }
        self.close().await;
        result
    }

    /// Stops a consumer that is not running and releases its connection.
    pub async fn stop(mut self) {
        self.close().await;
    }

    async fn close(&mut self) {
        if let Err(e) = self.broker.close().await {
            warn!(broker = self.broker.name(), error = %e, "Error while closing broker connection");
        }
        self.set_state(ConsumerState::Disconnected);
        info!(queue = %self.config.queue, "Queue consumer stopped");
    }

    async fn receive_loop(&mut self) -> Result<(), ConnectionError> {
        let mut stop = self.stop_rx.clone();
        loop {
            let stopped = *stop.borrow_and_update();
            if stopped {
                debug!("Stop requested");
                return Ok(());
            }

            self.set_state(ConsumerState::Receiving);
            let received = tokio::select! {
                biased;
                _ = stop.changed() => continue,
                received = self.broker.receive() => received,
            };
            let message =
                received.map_err(|e| ConnectionError::lost(self.broker.name(), e))?;

            // per-message failures are logged in handle_message and never end the loop
            let _ = self.handle_message(message).await;
        }
    }

    /// Reports the text body of `message` and acknowledges it. On any error
    /// the message is left unacknowledged for the broker to redeliver.
    pub async fn handle_message(&mut self, message: Message) -> Result<(), HandleError> {
        self.set_state(ConsumerState::Processing);
        let result = self.process(&message).await;
        match &result {
            Ok(()) => debug!(tag = %message.tag, "Message acknowledged"),
            Err(HandleError::Payload(e)) => {
                warn!(tag = %message.tag, attempt = message.attempt, error = %e, "Leaving message unacknowledged")
            }
            Err(e) => {
                error!(tag = %message.tag, attempt = message.attempt, error = %e, "Leaving message unacknowledged")
            }
        }
        self.set_state(ConsumerState::Receiving);
        result
    }

    async fn process(&mut self, message: &Message) -> Result<(), HandleError> {
        let Payload::Text(body) = &message.payload else {
            return Err(PayloadError {
                tag: message.tag.clone(),
                len: message.payload.len(),
            }
            .into());
        };

        self.sink
            .report(&format!("{}{}", self.config.report_prefix, body))?;

        self.broker
            .acknowledge(&message.tag)
            .await
            .map_err(|source| HandleError::Acknowledge {
                tag: message.tag.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::{ConsumerState, QueueConsumer, StopHandle};
    use crate::broker::{DeliveryTag, Message, MessageBroker, Payload};
    use crate::configs::{BrokerTypeConfig, ConsumerConfig};
    use crate::error::{ConnectionError, HandleError, SinkError};
    use crate::in_memory_broker::{InMemoryBroker, InMemoryOptions, QueueStats};
    use crate::sink::{MemorySink, ReportSink};

    const QUEUE: &str = "OrderQueue";

    fn config() -> ConsumerConfig {
        ConsumerConfig::default()
    }

    async fn consumer_with_sink<S: ReportSink + 'static>(
        sink: S,
    ) -> (QueueConsumer<S>, InMemoryBroker) {
        let broker = InMemoryBroker::default();
        let publisher = broker.clone();
        let consumer = QueueConsumer::with_broker(config(), Box::new(broker), sink)
            .await
            .unwrap();
        (consumer, publisher)
    }

    async fn wait_for_lines(sink: &MemorySink, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.lines().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer did not report in time");
    }

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn report(&mut self, _line: &str) -> Result<(), SinkError> {
            Err(SinkError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdout closed",
            )))
        }
    }

    /// Requests a stop from inside the first report, i.e. mid-message.
    struct StoppingSink {
        inner: MemorySink,
        handle: Option<StopHandle>,
    }

    impl ReportSink for StoppingSink {
        fn report(&mut self, line: &str) -> Result<(), SinkError> {
            if let Some(handle) = &self.handle {
                handle.stop();
            }
            self.inner.report(line)
        }
    }

    struct DroppedConnectionBroker {
        closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl MessageBroker for DroppedConnectionBroker {
        fn name(&self) -> &str {
            "dropped"
        }

        async fn connect(&mut self, _queue: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn receive(&mut self) -> Result<Message> {
            bail!("connection reset by peer")
        }

        async fn acknowledge(&mut self, _tag: &DeliveryTag) -> Result<()> {
            Ok(())
        }

        async fn publish(&mut self, _queue: &str, _payload: Payload) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_text_message_is_reported_and_acknowledged_once() {
        let sink = MemorySink::default();
        let (mut consumer, mut publisher) = consumer_with_sink(sink.clone()).await;

        publisher
            .publish(QUEUE, Payload::Text("order-123".to_string()))
            .await
            .unwrap();
        let message = {
            let mut receiver = publisher.clone();
            receiver.connect(QUEUE).await.unwrap();
            receiver.receive().await.unwrap()
        };
        // the receiving clone and the consumer share the queue's in-flight set
        consumer.handle_message(message).await.unwrap();

        assert_eq!(sink.lines(), vec!["Order received: order-123"]);
        assert_eq!(
            publisher.stats(QUEUE).unwrap(),
            QueueStats {
                ready: 0,
                in_flight: 0,
                acknowledged: 1,
            }
        );
        assert_eq!(consumer.state(), ConsumerState::Receiving);
    }

    #[tokio::test]
    async fn a_binary_message_is_left_unacknowledged() {
        let sink = MemorySink::default();
        let (mut consumer, mut publisher) = consumer_with_sink(sink.clone()).await;

        publisher
            .publish(QUEUE, Payload::Binary(vec![0xca, 0xfe]))
            .await
            .unwrap();
        let mut receiver = publisher.clone();
        receiver.connect(QUEUE).await.unwrap();
        let message = receiver.receive().await.unwrap();

        let result = consumer.handle_message(message).await;

        assert!(matches!(result, Err(HandleError::Payload(ref e)) if e.len == 2));
        assert!(sink.lines().is_empty());
        assert_eq!(publisher.stats(QUEUE).unwrap().in_flight, 1);
        assert_eq!(publisher.stats(QUEUE).unwrap().acknowledged, 0);
        assert_eq!(consumer.state(), ConsumerState::Receiving);
    }

    #[tokio::test]
    async fn a_failing_sink_leaves_the_message_unacknowledged() {
        let (mut consumer, mut publisher) = consumer_with_sink(FailingSink).await;

        publisher
            .publish(QUEUE, Payload::Text("order-123".to_string()))
            .await
            .unwrap();
        let mut receiver = publisher.clone();
        receiver.connect(QUEUE).await.unwrap();
        let message = receiver.receive().await.unwrap();

        let result = consumer.handle_message(message).await;

        assert!(matches!(result, Err(HandleError::Sink(_))));
        assert_eq!(publisher.stats(QUEUE).unwrap().acknowledged, 0);
    }

    #[tokio::test]
    async fn the_loop_survives_a_binary_message_and_processes_the_next_one() {
        let sink = MemorySink::default();
        let (consumer, mut publisher) = consumer_with_sink(sink.clone()).await;
        let stop = consumer.stop_handle();
        let running = tokio::spawn(consumer.run());

        publisher
            .publish_all(
                QUEUE,
                vec![
                    Payload::Text("order-123".to_string()),
                    Payload::Binary(vec![0, 159, 146, 150]),
                    Payload::Text("order-456".to_string()),
                ],
            )
            .await
            .unwrap();
        wait_for_lines(&sink, 2).await;

        stop.stop();
        running.await.unwrap().unwrap();

        assert_eq!(
            sink.lines(),
            vec!["Order received: order-123", "Order received: order-456"]
        );
        // the binary message went back to the queue when the connection closed
        assert_eq!(
            publisher.stats(QUEUE).unwrap(),
            QueueStats {
                ready: 1,
                in_flight: 0,
                acknowledged: 2,
            }
        );
    }

    #[tokio::test]
    async fn stop_while_idle_disconnects_and_releases_the_connection() {
        let (consumer, mut publisher) = consumer_with_sink(MemorySink::default()).await;
        let mut state = consumer.watch_state();
        let stop = consumer.stop_handle();
        let running = tokio::spawn(consumer.run());

        state
            .wait_for(|s| *s == ConsumerState::Receiving)
            .await
            .unwrap();
        stop.stop();
        running.await.unwrap().unwrap();

        assert_eq!(*state.borrow(), ConsumerState::Disconnected);
        // nothing consumes the queue any more
        publisher
            .publish(QUEUE, Payload::Text("late".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(publisher.stats(QUEUE).unwrap().ready, 1);
    }

    #[tokio::test]
    async fn stopping_a_consumer_that_never_ran() {
        let (consumer, _publisher) = consumer_with_sink(MemorySink::default()).await;
        let state = consumer.watch_state();
        assert_eq!(*state.borrow(), ConsumerState::Connected);

        consumer.stop().await;
        assert_eq!(*state.borrow(), ConsumerState::Disconnected);
    }

    #[tokio::test]
    async fn a_stop_requested_mid_message_takes_effect_after_it() {
        let inner = MemorySink::default();
        let broker = InMemoryBroker::default();
        let mut publisher = broker.clone();
        let sink = StoppingSink {
            inner: inner.clone(),
            handle: None,
        };
        let mut consumer = QueueConsumer::with_broker(config(), Box::new(broker), sink)
            .await
            .unwrap();
        consumer.sink.handle = Some(consumer.stop_handle());

        publisher
            .publish_all(
                QUEUE,
                vec![
                    Payload::Text("first".to_string()),
                    Payload::Text("second".to_string()),
                ],
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), consumer.run())
            .await
            .expect("consumer did not stop")
            .unwrap();

        assert_eq!(inner.lines(), vec!["Order received: first"]);
        assert_eq!(
            publisher.stats(QUEUE).unwrap(),
            QueueStats {
                ready: 1,
                in_flight: 0,
                acknowledged: 1,
            }
        );
    }

    #[tokio::test]
    async fn starting_against_a_missing_queue_is_a_connection_error() {
        let config = ConsumerConfig {
            broker: BrokerTypeConfig::InMemory(InMemoryOptions {
                declare: false,
                ..Default::default()
            }),
            ..config()
        };

        let result = QueueConsumer::start(config, MemorySink::default()).await;
        assert!(matches!(result, Err(ConnectionError::QueueNotFound(q)) if q == QUEUE));
    }

    #[tokio::test]
    async fn starting_against_an_unreachable_broker_is_a_connection_error() {
        let config = ConsumerConfig {
            broker: "redis://127.0.0.1:1".parse().unwrap(),
            ..config()
        };

        let result = QueueConsumer::start(config, MemorySink::default()).await;
        assert!(matches!(result, Err(ConnectionError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn a_lost_connection_ends_the_loop_and_closes_the_broker() {
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let broker = DroppedConnectionBroker {
            closed: closed.clone(),
        };
        let consumer = QueueConsumer::with_broker(config(), Box::new(broker), MemorySink::default())
            .await
            .unwrap();
        let state = consumer.watch_state();

        let result = consumer.run().await;

        assert!(matches!(result, Err(ConnectionError::Lost { .. })));
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*state.borrow(), ConsumerState::Disconnected);
    }
}
