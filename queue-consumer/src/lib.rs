pub mod broker;
pub mod configs;
pub mod consumer;
pub mod error;
pub mod in_memory_broker;
pub mod logging;
pub mod mqtt_broker;
pub mod nats_broker;
pub mod redis_broker;
pub mod sink;

pub use broker::{DeliveryTag, Message, MessageBroker, Payload};
pub use configs::{BrokerTypeConfig, ConsumerConfig};
pub use consumer::{ConsumerState, QueueConsumer, StopHandle};
pub use error::{ConnectionError, HandleError, PayloadError, SinkError};
pub use sink::{MemorySink, ReportSink, StdoutSink};
