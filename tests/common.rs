#![allow(dead_code)]

use std::sync::{Arc, Once};

use pubsub_listener::core::ack::MemoryService;
use pubsub_listener::core::error::ErrorSink;
use pubsub_listener::{ack_callback, AckBuffer, AckCallback, AckResult, AckService, Config, ListenerError};

pub const SUBSCRIPTION: &str = "projects/test/subscriptions/test-sub";

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = pubsub_listener::logging::init_logging();
    });
}

/// Config with the periodic flush effectively disabled so tests flush by hand.
pub fn test_config(exactly_once: bool) -> Config {
    let mut cfg = Config {
        subscription: SUBSCRIPTION.to_string(),
        ..Default::default()
    };
    cfg.listener.exactly_once_delivery = exactly_once;
    cfg.listener.shutdown_grace_ms = 5_000;
    cfg.buffer.interval_ms = 3_600_000;
    cfg
}

pub fn buffer_with(
    cfg: &Config,
    service: Arc<MemoryService>,
) -> (AckBuffer, flume::Receiver<ListenerError>) {
    let (errors, rx) = ErrorSink::new(64);
    let service: Arc<dyn AckService> = service;
    (AckBuffer::new(cfg, service, errors), rx)
}

/// Completion callback that forwards every result to a channel.
pub fn result_channel() -> (AckCallback, flume::Receiver<AckResult>) {
    let (tx, rx) = flume::unbounded();
    let callback = ack_callback(move |result| {
        let _ = tx.send(result);
        Ok(())
    });
    (callback, rx)
}
