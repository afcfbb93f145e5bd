use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::Path};

/// Settings for the listener as a whole.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ListenerConfig {
    /// Ack deadline, in seconds, used when renewing leases.
    pub deadline_secs: i32,
    pub message_ordering: bool,
    pub exactly_once_delivery: bool,
    /// Size of the callback and retry pools.
    pub callback_threads: usize,
    /// Concurrent RPCs per flush.
    pub push_threads: usize,
    /// How long shutdown waits for in-flight work before aborting it.
    pub shutdown_grace_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 60,
            message_ordering: false,
            exactly_once_delivery: false,
            callback_threads: 8,
            push_threads: 4,
            shutdown_grace_ms: 60_000,
        }
    }
}

impl ListenerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BufferConfig {
    /// Upper bound on the encoded size of a single request.
    pub max_bytes: usize,
    pub interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 500_000,
            interval_ms: 1_000,
        }
    }
}

impl BufferConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Backoff applied to transient exactly-once failures.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// The server accepts acks and modacks for ten minutes at most.
    pub max_elapsed_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 64_000,
            max_elapsed_ms: 600_000,
            max_attempts: 15,
        }
    }
}

/// Lease management and flow control for held messages.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LeaseConfig {
    pub renew_interval_ms: u64,
    /// Messages held longer than this are no longer renewed.
    pub max_total_lease_secs: u64,
    /// Bounds on the deadline sent with each renewal; 0 disables the bound.
    pub min_duration_per_lease_extension: i32,
    pub max_duration_per_lease_extension: i32,
    /// Flow control: the listener reports itself full once either limit is hit.
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renew_interval_ms: 30_000,
            max_total_lease_secs: 3_600,
            min_duration_per_lease_extension: 0,
            max_duration_per_lease_extension: 0,
            max_outstanding_messages: 1_000,
            max_outstanding_bytes: 100_000_000,
        }
    }
}

impl LeaseConfig {
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// Deadline to request when renewing, `deadline` clamped to the
    /// configured per-extension bounds.
    pub fn extension_deadline(&self, deadline: i32) -> i32 {
        let mut secs = deadline;
        if self.max_duration_per_lease_extension > 0 {
            secs = secs.min(self.max_duration_per_lease_extension);
        }
        if self.min_duration_per_lease_extension > 0 {
            secs = secs.max(self.min_duration_per_lease_extension);
        }
        secs
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub subscription: String,
    pub listener: ListenerConfig,
    pub buffer: BufferConfig,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<Config, anyhow::Error> {
    let config: Config = toml::from_str(raw)?;
    if config.listener.push_threads == 0 || config.listener.callback_threads == 0 {
        anyhow::bail!("thread pool sizes must be at least 1");
    }
    if config.buffer.max_bytes == 0 {
        anyhow::bail!("buffer.max_bytes must be positive");
    }
    if config.buffer.interval_ms == 0 {
        anyhow::bail!("buffer.interval_ms must be positive");
    }
    if config.lease.renew_interval_ms == 0 {
        anyhow::bail!("lease.renew_interval_ms must be positive");
    }
    if config.lease.max_outstanding_messages == 0 || config.lease.max_outstanding_bytes == 0 {
        anyhow::bail!("flow control limits must be positive");
    }
    let lease = &config.lease;
    if lease.min_duration_per_lease_extension < 0
        || lease.max_duration_per_lease_extension < 0
        || (lease.max_duration_per_lease_extension > 0
            && lease.min_duration_per_lease_extension > lease.max_duration_per_lease_extension)
    {
        anyhow::bail!("lease extension bounds must satisfy 0 <= min <= max");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let cfg = parse_config("subscription = \"projects/p/subscriptions/s\"").unwrap();
        assert_eq!(cfg.subscription, "projects/p/subscriptions/s");
        assert_eq!(cfg.buffer.max_bytes, 500_000);
        assert_eq!(cfg.buffer.interval(), Duration::from_secs(1));
        assert_eq!(cfg.listener.callback_threads, 8);
        assert_eq!(cfg.listener.push_threads, 4);
        assert!(!cfg.listener.exactly_once_delivery);
        assert_eq!(cfg.retry.max_attempts, 15);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
            [buffer]
            max_bytes = 1024

            [listener]
            exactly_once_delivery = true
        "#;
        let cfg = parse_config(raw).unwrap();
        assert_eq!(cfg.buffer.max_bytes, 1024);
        assert_eq!(cfg.buffer.interval_ms, 1_000);
        assert!(cfg.listener.exactly_once_delivery);
        assert_eq!(cfg.listener.deadline_secs, 60);
    }

    #[test]
    fn zero_sized_pools_are_rejected() {
        assert!(parse_config("[listener]\npush_threads = 0").is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = parse_config("[buffer]\ninterval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("interval_ms"));
        let err = parse_config("[lease]\nrenew_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("renew_interval_ms"));
    }

    #[test]
    fn flow_control_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.lease.max_outstanding_messages, 1_000);
        assert_eq!(cfg.lease.max_outstanding_bytes, 100_000_000);
        assert_eq!(cfg.lease.extension_deadline(60), 60);
    }

    #[test]
    fn extension_deadline_is_clamped() {
        let cfg = parse_config(
            "[lease]\nmin_duration_per_lease_extension = 20\nmax_duration_per_lease_extension = 30",
        )
        .unwrap();
        assert_eq!(cfg.lease.extension_deadline(60), 30);
        assert_eq!(cfg.lease.extension_deadline(10), 20);
        assert_eq!(cfg.lease.extension_deadline(25), 25);
        assert!(parse_config(
            "[lease]\nmin_duration_per_lease_extension = 40\nmax_duration_per_lease_extension = 30"
        )
        .is_err());
    }
}
