//! Publish a handful of messages and stream them back out.
//!
//! Defaults to the in-process broker; point it at a real one with e.g.
//! `cargo run -p mqclient --example pubsub -- --broker nats --address localhost:4222`

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mqclient::stream::{MessageStream, Outcome, StreamItem, StreamOptions};
use mqclient::{codec, Broker};

#[derive(Parser, Debug)]
#[command(name = "pubsub")]
struct Args {
    /// Backend to use: memory, nats, or rabbitmq
    #[arg(long, env = "MQ_BROKER", default_value = "memory")]
    broker: Broker,

    /// Broker address (host[:port]; the backend adds its scheme)
    #[arg(long, env = "MQ_ADDRESS", default_value = "localhost")]
    address: String,

    /// Queue name
    #[arg(long, env = "MQ_QUEUE", default_value = "demo")]
    queue: String,

    /// Number of messages to publish
    #[arg(long, default_value = "5")]
    count: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let client = args.broker.client();

    let mut pub_q = client.create_pub_queue(&args.address, &args.queue, None).await?;
    for i in 0..args.count {
        let payload = codec::serialize(
            json!({"n": i}),
            HashMap::from([("origin".to_string(), "pubsub-demo".to_string())]),
        )?;
        pub_q.send(payload).await?;
    }
    pub_q.close().await?;
    info!(count = args.count, queue = %args.queue, "published");

    let mut sub_q = client.create_sub_queue(&args.address, &args.queue, 1, None).await?;
    let opts = StreamOptions {
        inactivity_timeout: Duration::from_secs(2),
        ..StreamOptions::default()
    };
    let mut stream = MessageStream::new(sub_q.as_mut(), opts);
    while let Some(item) = stream.next().await? {
        match item {
            StreamItem::Delivered(mut msg) => {
                info!(msg_id = %msg.msg_id(), data = %msg.data()?, "received");
                stream.ack(&mut msg).await?;
                stream.resolve(Outcome::Continue);
            }
            StreamItem::Skipped => {}
        }
    }
    sub_q.close().await?;
    info!("queue drained");
    Ok(())
}
