//! pubsub-listener – drives a listener against the in-memory backend.
//
//  $ pubsub-listener --config listener.toml --messages 10000 --keys 8
//  $ pubsub-listener --exactly-once --fail-every 50
use pubsub_listener::core::ack::{MemoryService, RpcKind};
use pubsub_listener::logging::init_logging;
use pubsub_listener::{
    ack_callback, load_config, AckService, Config, Message, MessageListener, ServiceError,
    StatusCode,
};

use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pubsub-listener", version, about = "Ordered delivery + ack buffer driver")]
struct Cli {
    /// Path to config TOML (env PUBSUB_LISTENER_CONFIG overrides)
    #[arg(short, long)]
    config: Option<String>,

    /// Number of messages to deliver.
    #[arg(short, long, default_value_t = 1_000)]
    messages: u64,

    /// Distinct ordering keys; 0 delivers unordered.
    #[arg(short, long, default_value_t = 4)]
    keys: u64,

    /// Nack every Nth message (0 = never).
    #[arg(long, default_value_t = 0)]
    nack_every: u64,

    /// Enable exactly-once delivery handling.
    #[arg(long)]
    exactly_once: bool,

    /// Script a transient backend failure every N flushed acks (0 = never).
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Simulated backend latency in milliseconds.
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,
}

#[derive(Default)]
struct Stats {
    handled: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    ack_failures: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let cfg_path = std::env::var("PUBSUB_LISTENER_CONFIG").ok().or(cli.config);
    let mut cfg: Config = match cfg_path {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    if cfg.subscription.is_empty() {
        cfg.subscription = "projects/demo/subscriptions/demo-sub".to_string();
    }
    cfg.listener.message_ordering = cli.keys > 0;
    cfg.listener.exactly_once_delivery |= cli.exactly_once;

    let backend = Arc::new(MemoryService::with_latency(Duration::from_millis(cli.latency_ms)));
    if cli.fail_every > 0 {
        for _ in 0..cli.messages / cli.fail_every {
            backend.fail_next_acknowledge(ServiceError::new(
                StatusCode::Internal,
                "simulated transient failure",
            ));
        }
    }

    let stats = Arc::new(Stats::default());
    let handler_stats = Arc::clone(&stats);
    let nack_every = cli.nack_every;
    let service: Arc<dyn AckService> = backend.clone();
    let listener = MessageListener::new(cfg, service, move |msg| {
        let n = handler_stats.handled.fetch_add(1, Ordering::Relaxed) + 1;
        if nack_every > 0 && n % nack_every == 0 {
            handler_stats.nacked.fetch_add(1, Ordering::Relaxed);
            msg.nack();
            return Ok(());
        }
        let stats = Arc::clone(&handler_stats);
        msg.ack_with(ack_callback(move |result| {
            if result.is_success() {
                stats.acked.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.ack_failures.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }));
        Ok(())
    });
    listener.on_error(|err| warn!(error = %err, "listener error"));
    listener.start();

    let started = Instant::now();
    for i in 0..cli.messages {
        let mut message = Message::new(Uuid::new_v4().to_string(), format!("payload-{i}"))
            .with_message_id(i.to_string());
        if cli.keys > 0 {
            message = message.with_ordering_key(format!("key-{}", i % cli.keys));
        }
        listener.receive(message).await;
    }

    while stats.handled.load(Ordering::Relaxed) < cli.messages {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    listener.stop().await;

    let calls = backend.calls();
    let ack_rpcs = calls.iter().filter(|c| c.kind == RpcKind::Acknowledge).count();
    info!(
        elapsed = ?started.elapsed(),
        handled = stats.handled.load(Ordering::Relaxed),
        acked = stats.acked.load(Ordering::Relaxed),
        nacked = stats.nacked.load(Ordering::Relaxed),
        ack_failures = stats.ack_failures.load(Ordering::Relaxed),
        ack_rpcs,
        modack_rpcs = calls.len() - ack_rpcs,
        "run complete"
    );
    Ok(())
}
