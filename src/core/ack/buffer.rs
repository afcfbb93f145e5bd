//! Time-windowed buffer for acknowledge and modify-deadline requests.
//!
//! Requests are recorded per ack id (the latest action wins) and sent in
//! batches by a periodic flush. Each flush dispatches its RPCs concurrently
//! on a pool bounded by `push_threads`. Failures on exactly-once
//! subscriptions are split per id into permanent results and transient ids
//! that are retried in the background with exponential backoff.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{Config, RetryConfig};
use crate::core::ack::request::{FlushRequests, PendingAction};
use crate::core::ack::result::AckResult;
use crate::core::ack::service::{AckService, ServiceError, PERMANENT_FAILURE};
use crate::core::error::{panic_message, ErrorSink, ListenerError};
use crate::core::pool::WorkerPool;
use crate::util::ExponentialBackoff;

/// Completion callback for an ack or modify-deadline request.
///
/// An `Err` (or a panic) is reported on the listener's error channel and
/// never affects the buffer.
pub type AckCallback = Arc<dyn Fn(AckResult) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure as an [`AckCallback`].
pub fn ack_callback<F>(f: F) -> AckCallback
where
    F: Fn(AckResult) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Floor for the flush period; `tokio::time::interval` panics on zero.
pub(crate) const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Acknowledge,
    ModifyAckDeadline(i32),
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Acknowledge => "acknowledge",
            Operation::ModifyAckDeadline(_) => "modify_ack_deadline",
        }
    }
}

#[derive(Default)]
struct Register {
    /// Insertion counter; keeps flushed ids in the order they were first seen.
    next_seq: u64,
    pending: HashMap<String, (u64, PendingAction)>,
    ack_callbacks: HashMap<String, AckCallback>,
    modack_callbacks: HashMap<String, AckCallback>,
}

impl Register {
    fn set(&mut self, ack_id: String, action: PendingAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .entry(ack_id)
            .and_modify(|entry| entry.1 = action)
            .or_insert((seq, action));
    }

    fn set_if_absent(&mut self, ack_id: String, action: PendingAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.entry(ack_id).or_insert((seq, action));
    }

    fn drain(&mut self) -> Vec<(String, PendingAction)> {
        let mut entries: Vec<_> = std::mem::take(&mut self.pending).into_iter().collect();
        entries.sort_unstable_by_key(|(_, (seq, _))| *seq);
        entries
            .into_iter()
            .map(|(id, (_, action))| (id, action))
            .collect()
    }
}

struct Timer {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    subscription: String,
    service: Arc<dyn AckService>,
    exactly_once: AtomicBool,
    max_bytes: usize,
    interval: Duration,
    push_threads: usize,
    shutdown_grace: Duration,
    retry: RetryConfig,
    register: Mutex<Register>,
    retry_pool: WorkerPool,
    callback_pool: WorkerPool,
    errors: ErrorSink,
    timer: Mutex<Option<Timer>>,
}

/// Handle to a subscription's acknowledgement buffer. Clones share state.
#[derive(Clone)]
pub struct AckBuffer {
    shared: Arc<Shared>,
}

impl fmt::Debug for AckBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckBuffer")
            .field("subscription", &self.shared.subscription)
            .field("pending", &self.pending_count())
            .field("started", &self.is_started())
            .finish()
    }
}

impl AckBuffer {
    pub fn new(config: &Config, service: Arc<dyn AckService>, errors: ErrorSink) -> Self {
        let threads = config.listener.callback_threads;
        let shared = Shared {
            subscription: config.subscription.clone(),
            service,
            exactly_once: AtomicBool::new(config.listener.exactly_once_delivery),
            max_bytes: config.buffer.max_bytes,
            interval: config.buffer.interval().max(MIN_TIMER_PERIOD),
            push_threads: config.listener.push_threads,
            shutdown_grace: config.listener.shutdown_grace(),
            retry: config.retry.clone(),
            register: Mutex::new(Register::default()),
            retry_pool: WorkerPool::new("retry", threads, errors.clone()),
            callback_pool: WorkerPool::new("callback", threads, errors.clone()),
            errors,
            timer: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn subscription(&self) -> &str {
        &self.shared.subscription
    }

    pub fn max_bytes(&self) -> usize {
        self.shared.max_bytes
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn exactly_once_delivery(&self) -> bool {
        self.shared.exactly_once.load(Ordering::Acquire)
    }

    pub fn set_exactly_once_delivery(&self, enabled: bool) {
        self.shared.exactly_once.store(enabled, Ordering::Release);
    }

    // ───────────────────────────────────────────────────────────
    // Recording
    // ───────────────────────────────────────────────────────────

    /// Records an ack for each id, replacing any pending action.
    pub fn acknowledge<I, S>(&self, ack_ids: I, callback: Option<AckCallback>) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ack_ids: Vec<String> = ack_ids.into_iter().map(Into::into).collect();
        if ack_ids.is_empty() {
            return false;
        }

        let mut reg = self.shared.register.lock();
        for ack_id in ack_ids {
            if let Some(cb) = &callback {
                reg.ack_callbacks.insert(ack_id.clone(), Arc::clone(cb));
            }
            reg.set(ack_id, PendingAction::Ack);
        }
        true
    }

    /// Records a deadline change for each id, replacing any pending action.
    /// A deadline of zero releases the messages for redelivery.
    pub fn modify_ack_deadline<I, S>(
        &self,
        deadline: i32,
        ack_ids: I,
        callback: Option<AckCallback>,
    ) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ack_ids: Vec<String> = ack_ids.into_iter().map(Into::into).collect();
        if ack_ids.is_empty() {
            return false;
        }

        let mut reg = self.shared.register.lock();
        for ack_id in ack_ids {
            if let Some(cb) = &callback {
                reg.modack_callbacks.insert(ack_id.clone(), Arc::clone(cb));
            }
            reg.set(ack_id, PendingAction::ModifyDeadline(deadline));
        }
        true
    }

    /// Records a lease extension only for ids with nothing pending.
    pub fn renew_lease<I, S>(&self, deadline: i32, ack_ids: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ack_ids: Vec<String> = ack_ids.into_iter().map(Into::into).collect();
        if ack_ids.is_empty() {
            return false;
        }

        let mut reg = self.shared.register.lock();
        for ack_id in ack_ids {
            reg.set_if_absent(ack_id, PendingAction::ModifyDeadline(deadline));
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.shared.register.lock().pending.len()
    }

    pub fn pending_action(&self, ack_id: &str) -> Option<PendingAction> {
        self.shared
            .register
            .lock()
            .pending
            .get(ack_id)
            .map(|(_, action)| *action)
    }

    // ───────────────────────────────────────────────────────────
    // Flushing
    // ───────────────────────────────────────────────────────────

    /// Sends everything recorded so far. Returns `false` if there was nothing
    /// to send.
    pub async fn flush(&self) -> bool {
        let requests = self.take_requests();
        if requests.is_empty() {
            return false;
        }
        debug!(
            subscription = %self.shared.subscription,
            acknowledge = requests.acknowledge.len(),
            modify_ack_deadline = requests.modify_ack_deadline.len(),
            "flushing ack buffer"
        );

        let pool = WorkerPool::new("dispatch", self.shared.push_threads, self.shared.errors.clone());
        for req in requests.acknowledge {
            let this = self.clone();
            pool.spawn(async move { this.send(Operation::Acknowledge, req.ack_ids).await });
        }
        for req in requests.modify_ack_deadline {
            let this = self.clone();
            let op = Operation::ModifyAckDeadline(req.ack_deadline_seconds);
            pool.spawn(async move { this.send(op, req.ack_ids).await });
        }
        pool.shutdown();

        if pool.drain(self.shared.shutdown_grace).await.is_err() {
            self.shared.errors.report(ListenerError::DispatchTimeout);
        }
        true
    }

    fn take_requests(&self) -> FlushRequests {
        let entries = {
            let mut reg = self.shared.register.lock();
            if reg.pending.is_empty() {
                return FlushRequests::default();
            }
            reg.drain()
        };
        FlushRequests::build(&self.shared.subscription, entries, self.shared.max_bytes)
    }

    async fn call(&self, op: Operation, ack_ids: Vec<String>) -> Result<(), ServiceError> {
        let service = &self.shared.service;
        let subscription = self.shared.subscription.as_str();
        match op {
            Operation::Acknowledge => service.acknowledge(subscription, ack_ids).await,
            Operation::ModifyAckDeadline(deadline) => {
                service
                    .modify_ack_deadline(subscription, ack_ids, deadline)
                    .await
            }
        }
    }

    async fn send(&self, op: Operation, ack_ids: Vec<String>) {
        match self.call(op, ack_ids.clone()).await {
            Ok(()) => self.resolve(op, &ack_ids, AckResult::success()),
            Err(err) if err.code.is_exactly_once_retriable() && self.exactly_once_delivery() => {
                warn!(op = op.name(), ids = ack_ids.len(), error = %err, "transient failure, partitioning ids");
                let transient = self.partition_failure(op, &ack_ids, &err);
                self.retry_async(op, transient);
            }
            Err(err) => {
                warn!(op = op.name(), ids = ack_ids.len(), error = %err, "request failed");
                self.resolve(op, &ack_ids, AckResult::from_error(err));
            }
        }
    }

    /// Resolves the ids the error metadata settles and returns the ones worth
    /// retrying. Without metadata every id is retried; with it, unlisted ids
    /// succeeded and ids marked permanent get the classified failure.
    fn partition_failure(&self, op: Operation, ack_ids: &[String], err: &ServiceError) -> Vec<String> {
        let Some(metadata) = &err.metadata else {
            return ack_ids.to_vec();
        };

        let mut succeeded = Vec::new();
        let mut permanent = Vec::new();
        let mut transient = Vec::new();
        for ack_id in ack_ids {
            match metadata.get(ack_id) {
                Some(reason) if reason.contains(PERMANENT_FAILURE) => permanent.push(ack_id.clone()),
                Some(_) => transient.push(ack_id.clone()),
                None => succeeded.push(ack_id.clone()),
            }
        }

        if !succeeded.is_empty() {
            self.resolve(op, &succeeded, AckResult::success());
        }
        if !permanent.is_empty() {
            self.resolve(op, &permanent, AckResult::from_error(err.clone()));
        }
        transient
    }

    fn retry_async(&self, op: Operation, ack_ids: Vec<String>) {
        if ack_ids.is_empty() {
            return;
        }
        let count = ack_ids.len();
        let this = self.clone();
        if !self
            .shared
            .retry_pool
            .spawn(async move { this.retry(op, ack_ids).await })
        {
            debug!(op = op.name(), ids = count, "retry pool stopped, not retrying");
        }
    }

    async fn retry(&self, op: Operation, ack_ids: Vec<String>) {
        let mut backoff = ExponentialBackoff::new(&self.shared.retry);
        let mut remaining = ack_ids;

        loop {
            match self.call(op, remaining.clone()).await {
                Ok(()) => {
                    trace!(op = op.name(), ids = remaining.len(), attempts = backoff.attempts() + 1, "retry succeeded");
                    self.resolve(op, &remaining, AckResult::success());
                    return;
                }
                Err(err) if err.code.is_exactly_once_retriable() => {
                    remaining = self.partition_failure(op, &remaining, &err);
                    if remaining.is_empty() {
                        return;
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            debug!(op = op.name(), ids = remaining.len(), ?delay, "retrying transient failure");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(op = op.name(), ids = remaining.len(), error = %err, "retry budget exhausted");
                            self.resolve(op, &remaining, AckResult::exhausted(err));
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.resolve(op, &remaining, AckResult::from_error(err));
                    return;
                }
            }
        }
    }

    /// Hands `result` to every callback registered for `ack_ids` and forgets
    /// those registrations.
    fn resolve(&self, op: Operation, ack_ids: &[String], result: AckResult) {
        let callbacks: Vec<AckCallback> = {
            let mut reg = self.shared.register.lock();
            let registry = match op {
                Operation::Acknowledge => &mut reg.ack_callbacks,
                Operation::ModifyAckDeadline(_) => &mut reg.modack_callbacks,
            };
            ack_ids.iter().filter_map(|id| registry.remove(id)).collect()
        };

        for callback in callbacks {
            self.callback_async(callback, result.clone());
        }
    }

    fn callback_async(&self, callback: AckCallback, result: AckResult) {
        let errors = self.shared.errors.clone();
        self.shared.callback_pool.spawn(async move {
            match tokio::task::spawn_blocking(move || callback(result)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.report(ListenerError::Callback(format!("{e:#}"))),
                Err(join) if join.is_panic() => {
                    let reason = panic_message(join.into_panic().as_ref());
                    errors.report(ListenerError::Callback(reason));
                }
                Err(_) => {}
            }
        });
    }

    // ───────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────

    /// Starts the periodic flush. Must be called from within a tokio runtime.
    pub fn start(&self) -> &Self {
        let mut timer = self.shared.timer.lock();
        if timer.is_some() {
            return self;
        }
        self.shared.retry_pool.restart();
        self.shared.callback_pool.restart();

        let (cancel, mut cancelled) = watch::channel(false);
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = self.shared.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        AckBuffer { shared }.flush().await;
                    }
                    _ = cancelled.changed() => break,
                }
            }
        });

        *timer = Some(Timer { cancel, handle });
        info!(subscription = %self.shared.subscription, interval = ?period, "ack buffer started");
        self
    }

    /// Stops the timer and the worker pools, then sends whatever is still
    /// pending. In-flight pool work gets the shutdown grace period to finish.
    pub async fn stop(&self) {
        let timer = self.shared.timer.lock().take();
        if let Some(Timer { cancel, handle }) = timer {
            let _ = cancel.send(true);
            if let Err(e) = handle.await {
                if e.is_panic() {
                    self.shared
                        .errors
                        .report(ListenerError::Internal("ack buffer timer panicked".into()));
                }
            }
        }

        self.shared.retry_pool.shutdown();
        self.shared.callback_pool.shutdown();
        self.flush().await;

        for pool in [&self.shared.retry_pool, &self.shared.callback_pool] {
            if let Err(e) = pool.drain(self.shared.shutdown_grace).await {
                self.shared.errors.report(e);
            }
        }

        {
            let mut reg = self.shared.register.lock();
            reg.ack_callbacks.clear();
            reg.modack_callbacks.clear();
        }
        info!(subscription = %self.shared.subscription, "ack buffer stopped");
    }

    pub fn is_started(&self) -> bool {
        self.shared.timer.lock().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_started()
    }
}
