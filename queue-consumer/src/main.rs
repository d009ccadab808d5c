use std::process::ExitCode;

use clap::Parser;
use queue_consumer::{
    configs::{DEFAULT_QUEUE, DEFAULT_REPORT_PREFIX},
    BrokerTypeConfig, ConsumerConfig, QueueConsumer, StdoutSink,
};
use tracing::{error, info};

/// Consumes a queue one message at a time and prints every text body
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker url, e.g. `redis://127.0.0.1:6379` or `nats://localhost:4222?durable=orders`.
    /// The default `memory://` queue is local to this process and only useful for trying things out
    #[arg(short, long, env = "QUEUE_CONSUMER_BROKER", default_value = "memory://")]
    broker: BrokerTypeConfig,

    /// Queue to consume
    #[arg(short, long, env = "QUEUE_CONSUMER_QUEUE", default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Printed in front of every message body
    #[arg(long, env = "QUEUE_CONSUMER_PREFIX", default_value = DEFAULT_REPORT_PREFIX)]
    prefix: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    queue_consumer::logging::init();

    let Args {
        broker,
        queue,
        prefix,
    } = Args::parse();
    let config = ConsumerConfig {
        queue,
        broker,
        report_prefix: prefix,
    };

    let consumer = match QueueConsumer::start(config, StdoutSink).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, "Failed to start queue consumer");
            return ExitCode::FAILURE;
        }
    };

    let stop = consumer.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            stop.stop();
        }
    });

    match consumer.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
