use pubsub_listener::config::load_config;
use pubsub_listener::Config;

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("listener.toml").expect("failed to load config");

    assert_eq!(cfg.subscription, "projects/demo/subscriptions/demo-sub");
    assert!(cfg.listener.message_ordering);
    assert!(!cfg.listener.exactly_once_delivery);
    assert_eq!(cfg.listener.callback_threads, 8);
    assert_eq!(cfg.listener.push_threads, 4);
    assert_eq!(cfg.buffer.max_bytes, 500_000);
    assert_eq!(cfg.buffer.interval_ms, 1_000);
    assert_eq!(cfg.retry.max_backoff_ms, 64_000);
    assert_eq!(cfg.retry.max_attempts, 15);
    assert_eq!(cfg.lease.renew_interval_ms, 30_000);
    assert_eq!(cfg.lease.max_outstanding_messages, 1_000);
    assert_eq!(cfg.lease.max_outstanding_bytes, 100_000_000);
    assert_eq!(cfg.lease.max_duration_per_lease_extension, 0);
}

#[test]
fn missing_file_is_an_error() {
    assert!(load_config("does-not-exist.toml").is_err());
}
