use anyhow::{bail, Context, Error};
use clap::Parser;
use queue_consumer::{configs::DEFAULT_QUEUE, BrokerTypeConfig, Payload};
use tracing::info;

/// Publishes one message to a queue
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker url, same format as the consumer's; `memory://` is rejected since
    /// nothing outside this process could consume from it
    #[arg(short, long, env = "QUEUE_CONSUMER_BROKER")]
    broker: BrokerTypeConfig,

    /// Queue to publish to
    #[arg(short, long, env = "QUEUE_CONSUMER_QUEUE", default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Send the body as a binary message
    #[arg(long)]
    binary: bool,

    /// Message body
    body: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    queue_consumer::logging::init();

    let Args {
        broker,
        queue,
        binary,
        body,
    } = Args::parse();

    if !broker.is_shared() {
        bail!("memory:// queues exist only inside one process; publish through redis, nats or mqtt");
    }

    let payload = if binary {
        Payload::Binary(body.into_bytes())
    } else {
        Payload::Text(body)
    };

    let mut broker = broker.build("queue-publish".to_string());
    broker
        .publish(&queue, payload)
        .await
        .with_context(|| format!("publishing to {queue} via {}", broker.name()))?;
    info!(queue = %queue, broker = broker.name(), "Published message");
    broker.close().await?;

    Ok(())
}
