use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::broker::MessageBroker;
use crate::error::ConnectionError;
use crate::in_memory_broker::{InMemoryBroker, InMemoryOptions};
use crate::mqtt_broker::{MqttBroker, MqttConnectionInfo};
use crate::nats_broker::{NatsBroker, NatsConnectionInfo};
use crate::redis_broker::{RedisBroker, RedisConnectionInfo};

pub const DEFAULT_QUEUE: &str = "OrderQueue";
pub const DEFAULT_REPORT_PREFIX: &str = "Order received: ";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConsumerConfig {
    pub queue: String,
    pub broker: BrokerTypeConfig,
    pub report_prefix: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            broker: BrokerTypeConfig::default(),
            report_prefix: DEFAULT_REPORT_PREFIX.to_string(),
        }
    }
}

/// Which broker to talk to, written as `<scheme>://<address>[?<options>]`.
/// The query string holds backend options and is decoded with `serde_qs`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum BrokerTypeConfig {
    InMemory(InMemoryOptions),
    Redis(RedisConnectionInfo),
    Nats(NatsConnectionInfo),
    Mqtt(MqttConnectionInfo),
}

impl Default for BrokerTypeConfig {
    fn default() -> Self {
        BrokerTypeConfig::InMemory(InMemoryOptions::default())
    }
}

impl BrokerTypeConfig {
    /// Whether other processes can reach the queues. In-memory queues live
    /// and die with the process that built the broker.
    pub fn is_shared(&self) -> bool {
        !matches!(self, BrokerTypeConfig::InMemory(_))
    }

    pub fn build(&self, name: String) -> Box<dyn MessageBroker> {
        match self {
            BrokerTypeConfig::InMemory(options) => {
                Box::new(InMemoryBroker::new(name, options.clone()))
            }
            BrokerTypeConfig::Redis(info) => Box::new(RedisBroker::new(info.clone(), name)),
            BrokerTypeConfig::Nats(info) => Box::new(NatsBroker::new(info.clone(), name)),
            BrokerTypeConfig::Mqtt(info) => Box::new(MqttBroker::new(info.clone(), name)),
        }
    }
}

fn parse_options<T: DeserializeOwned>(query: &str) -> Result<T, ConnectionError> {
    serde_qs::from_str(query)
        .map_err(|e| ConnectionError::Misconfigured(format!("bad broker options {query:?}: {e}")))
}

impl FromStr for BrokerTypeConfig {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, query) = s.split_once('?').unwrap_or((s, ""));
        let Some((scheme, host)) = address.split_once("://") else {
            return Err(ConnectionError::Misconfigured(format!(
                "broker url {s:?} has no scheme"
            )));
        };
        if scheme != "memory" && host.is_empty() {
            return Err(ConnectionError::Misconfigured(format!(
                "broker url {s:?} has no address"
            )));
        }

        match scheme {
            "memory" => Ok(BrokerTypeConfig::InMemory(parse_options(query)?)),
            "redis" | "rediss" => {
                let mut info: RedisConnectionInfo = parse_options(query)?;
                info.address = address.to_string();
                Ok(BrokerTypeConfig::Redis(info))
            }
            "nats" | "tls" => {
                let mut info: NatsConnectionInfo = parse_options(query)?;
                info.address = address.to_string();
                Ok(BrokerTypeConfig::Nats(info))
            }
            "mqtt" | "mqtts" | "tcp" => {
                let mut info: MqttConnectionInfo = parse_options(query)?;
                info.address = address.to_string();
                Ok(BrokerTypeConfig::Mqtt(info))
            }
            other => Err(ConnectionError::Misconfigured(format!(
                "unsupported broker scheme {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::BrokerTypeConfig;
    use crate::error::ConnectionError;

    #[test]
    fn a_bare_memory_url_uses_default_options() {
        let config: BrokerTypeConfig = "memory://".parse().unwrap();
        assert_eq!(config, BrokerTypeConfig::default());
    }

    #[test]
    fn memory_options_come_from_the_query_string() {
        let config: BrokerTypeConfig = "memory://?visibility_timeout_ms=250&declare=false"
            .parse()
            .unwrap();
        let BrokerTypeConfig::InMemory(options) = config else {
            panic!("expected an in-memory broker");
        };
        assert_eq!(options.visibility_timeout_ms, 250);
        assert!(!options.declare);
    }

    #[test]
    fn redis_urls_keep_the_address_and_strip_options() {
        let config: BrokerTypeConfig = "redis://127.0.0.1:6379/2?group=billing&consumer=worker-1"
            .parse()
            .unwrap();
        let BrokerTypeConfig::Redis(info) = config else {
            panic!("expected a redis broker");
        };
        assert_eq!(info.address, "redis://127.0.0.1:6379/2");
        assert_eq!(info.group.as_deref(), Some("billing"));
        assert_eq!(info.consumer.as_deref(), Some("worker-1"));
    }

    #[test]
    fn nats_urls_parse_jetstream_options() {
        let config: BrokerTypeConfig = "nats://localhost:4222?durable=orders&ack_wait_ms=5000"
            .parse()
            .unwrap();
        let BrokerTypeConfig::Nats(info) = config else {
            panic!("expected a nats broker");
        };
        assert_eq!(info.address, "nats://localhost:4222");
        assert_eq!(info.durable.as_deref(), Some("orders"));
        assert_eq!(info.ack_wait_ms, Some(5000));
    }

    #[test]
    fn mqtt_urls_parse_nested_credentials() {
        let config: BrokerTypeConfig =
            "mqtt://localhost:1883?group=workers&credentials[username]=u&credentials[password]=p"
                .parse()
                .unwrap();
        let BrokerTypeConfig::Mqtt(info) = config else {
            panic!("expected an mqtt broker");
        };
        assert_eq!(info.address, "mqtt://localhost:1883");
        assert_eq!(info.group.as_deref(), Some("workers"));
        assert!(info.credentials.is_some());
    }

    #[test]
    fn unknown_schemes_are_misconfigured() {
        let result = "amqp://localhost:5672".parse::<BrokerTypeConfig>();
        assert!(matches!(result, Err(ConnectionError::Misconfigured(_))));
    }

    #[test]
    fn urls_without_a_scheme_or_address_are_misconfigured() {
        assert!(matches!(
            "localhost:6379".parse::<BrokerTypeConfig>(),
            Err(ConnectionError::Misconfigured(_))
        ));
        assert!(matches!(
            "redis://".parse::<BrokerTypeConfig>(),
            Err(ConnectionError::Misconfigured(_))
        ));
    }

    #[test]
    fn malformed_options_are_misconfigured() {
        let result = "memory://?visibility_timeout_ms=soon".parse::<BrokerTypeConfig>();
        assert!(matches!(result, Err(ConnectionError::Misconfigured(_))));
    }

    #[test]
    fn only_network_brokers_are_shared_between_processes() {
        assert!(!BrokerTypeConfig::default().is_shared());
        for url in [
            "redis://127.0.0.1:6379",
            "nats://localhost:4222",
            "mqtt://localhost:1883",
        ] {
            assert!(url.parse::<BrokerTypeConfig>().unwrap().is_shared(), "{url}");
        }
    }
}
