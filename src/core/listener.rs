//! The message listener: delivery pipeline entry point.
//!
//! Received messages enter through [`MessageListener::deliver`] (or
//! [`MessageListener::receive`], which honours flow control first) and are
//! held in the lease inventory until settled. With message ordering enabled
//! they pass through the [`Sequencer`] so each ordering key has at most one
//! message in the user handler at a time. The handler runs on a bounded pool
//! and settles each message through its [`ReceivedMessage`] handle, which
//! feeds the [`AckBuffer`]. Messages still held when the listener stops are
//! released for redelivery.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::Config;
use crate::core::ack::buffer::MIN_TIMER_PERIOD;
use crate::core::ack::{AckBuffer, AckCallback, AckService};
use crate::core::error::{panic_message, ErrorSink, ListenerError};
use crate::core::inventory::Inventory;
use crate::core::message::Message;
use crate::core::pool::WorkerPool;
use crate::core::sequencer::Sequencer;

/// User handler for received messages.
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) -> anyhow::Result<()> + Send + Sync>;

const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// A delivered message together with the means to settle it.
pub struct ReceivedMessage {
    message: Message,
    buffer: AckBuffer,
    inventory: Arc<Inventory>,
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("ack_id", &self.message.ack_id)
            .field("ordering_key", &self.message.ordering_key)
            .field("bytes", &self.message.payload.len())
            .finish()
    }
}

impl ReceivedMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn ack_id(&self) -> &str {
        &self.message.ack_id
    }

    pub fn ordering_key(&self) -> &str {
        &self.message.ordering_key
    }

    pub fn data(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn ack(&self) {
        self.inventory.remove(self.ack_id());
        self.buffer.acknowledge([self.ack_id()], None);
    }

    /// Acks and reports the outcome to `callback`.
    pub fn ack_with(&self, callback: AckCallback) {
        self.inventory.remove(self.ack_id());
        self.buffer.acknowledge([self.ack_id()], Some(callback));
    }

    /// Releases the message for immediate redelivery.
    pub fn nack(&self) {
        self.inventory.remove(self.ack_id());
        self.buffer.modify_ack_deadline(0, [self.ack_id()], None);
    }

    pub fn nack_with(&self, callback: AckCallback) {
        self.inventory.remove(self.ack_id());
        self.buffer
            .modify_ack_deadline(0, [self.ack_id()], Some(callback));
    }

    /// Extends (or, with zero, releases) the message's ack deadline.
    pub fn modify_ack_deadline(&self, seconds: i32) {
        if seconds == 0 {
            return self.nack();
        }
        self.buffer
            .modify_ack_deadline(seconds, [self.ack_id()], None);
    }

    pub fn modify_ack_deadline_with(&self, seconds: i32, callback: AckCallback) {
        if seconds == 0 {
            return self.nack_with(callback);
        }
        self.buffer
            .modify_ack_deadline(seconds, [self.ack_id()], Some(callback));
    }
}

struct LeaseTimer {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, Copy)]
struct State {
    started: bool,
    stopped: bool,
}

struct Inner {
    config: Config,
    buffer: AckBuffer,
    sequencer: Option<Sequencer<Message>>,
    handler: MessageHandler,
    inventory: Arc<Inventory>,
    message_pool: WorkerPool,
    errors: ErrorSink,
    error_rx: flume::Receiver<ListenerError>,
    state: Mutex<State>,
    lease: Mutex<Option<LeaseTimer>>,
}

impl Inner {
    /// Hands `message` to the user handler on the message pool. Ordered
    /// messages release their successor once the handler returns.
    fn dispatch(self: &Arc<Self>, message: Message) {
        let received = ReceivedMessage {
            message: message.clone(),
            buffer: self.buffer.clone(),
            inventory: Arc::clone(&self.inventory),
        };

        let inner = Arc::clone(self);
        let handler = Arc::clone(&self.handler);
        let in_flight = message.clone();
        let spawned = self.message_pool.spawn(async move {
            let ack_id = in_flight.ack_id.clone();
            match tokio::task::spawn_blocking(move || handler(received)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => inner.errors.report(ListenerError::MessageCallback {
                    ack_id,
                    reason: format!("{e:#}"),
                }),
                Err(join) if join.is_panic() => {
                    inner.errors.report(ListenerError::MessageCallback {
                        ack_id,
                        reason: panic_message(join.into_panic().as_ref()),
                    })
                }
                Err(_) => {}
            }
            inner.release(&in_flight);
        });

        if !spawned {
            debug!(ack_id = %message.ack_id, "listener stopped, releasing message");
            self.inventory.remove(&message.ack_id);
            self.buffer.modify_ack_deadline(0, [message.ack_id.as_str()], None);
            self.release(&message);
        }
    }

    fn release(&self, message: &Message) {
        if let Some(sequencer) = &self.sequencer {
            if let Err(e) = sequencer.next(message) {
                self.errors.report(e.into());
            }
        }
    }

    fn renew_leases(&self) {
        let lease = &self.config.lease;
        let ids = self
            .inventory
            .renewable(Duration::from_secs(lease.max_total_lease_secs));
        if ids.is_empty() {
            return;
        }
        let deadline = lease.extension_deadline(self.config.listener.deadline_secs);
        debug!(count = ids.len(), deadline, "renewing leases");
        self.buffer.renew_lease(deadline, ids);
    }
}

/// Processes messages for one subscription.
#[derive(Clone)]
pub struct MessageListener {
    inner: Arc<Inner>,
}

impl fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageListener")
            .field("subscription", &self.inner.config.subscription)
            .field("ordered", &self.inner.sequencer.is_some())
            .field("outstanding", &self.inner.inventory.len())
            .finish()
    }
}

impl MessageListener {
    pub fn new<F>(config: Config, service: Arc<dyn AckService>, handler: F) -> Self
    where
        F: Fn(ReceivedMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (errors, error_rx) = ErrorSink::new(ERROR_CHANNEL_CAPACITY);
        let buffer = AckBuffer::new(&config, service, errors.clone());
        let message_pool =
            WorkerPool::new("message", config.listener.callback_threads, errors.clone());

        let inventory = Arc::new(Inventory::new(
            config.lease.max_outstanding_messages,
            config.lease.max_outstanding_bytes,
        ));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let sequencer = config.listener.message_ordering.then(|| {
                let weak = weak.clone();
                Sequencer::new(move |message: Message| {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(message);
                    }
                })
            });

            Inner {
                config,
                buffer,
                sequencer,
                handler: Arc::new(handler),
                inventory,
                message_pool,
                errors,
                error_rx,
                state: Mutex::new(State::default()),
                lease: Mutex::new(None),
            }
        });

        Self { inner }
    }

    pub fn subscription(&self) -> &str {
        &self.inner.config.subscription
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn buffer(&self) -> &AckBuffer {
        &self.inner.buffer
    }

    pub fn sequencer(&self) -> Option<&Sequencer<Message>> {
        self.inner.sequencer.as_ref()
    }

    /// Messages received and not yet settled, queued ones included.
    pub fn outstanding(&self) -> usize {
        self.inner.inventory.len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.inner.inventory.bytes()
    }

    /// Whether `max_outstanding_messages` or `max_outstanding_bytes` is
    /// reached. The streaming pipeline should stop pulling while this holds.
    pub fn is_full(&self) -> bool {
        self.inner.inventory.is_full()
    }

    pub fn exactly_once_delivery(&self) -> bool {
        self.inner.buffer.exactly_once_delivery()
    }

    /// Updated by the streaming pipeline from subscription properties.
    pub fn set_exactly_once_delivery(&self, enabled: bool) {
        self.inner.buffer.set_exactly_once_delivery(enabled);
    }

    /// Entry point for the streaming pipeline. Does not wait for flow
    /// control; see [`receive`](Self::receive).
    pub fn deliver(&self, message: Message) {
        self.inner
            .inventory
            .add(&message.ack_id, message.byte_size());
        match &self.inner.sequencer {
            Some(sequencer) => sequencer.add(message),
            None => self.inner.dispatch(message),
        }
    }

    /// Waits until the inventory is below its limits, then delivers.
    pub async fn receive(&self, message: Message) {
        if self.inner.inventory.is_full() {
            debug!(
                outstanding = self.inner.inventory.len(),
                bytes = self.inner.inventory.bytes(),
                "flow control engaged"
            );
            self.inner.inventory.wait_for_capacity().await;
        }
        self.deliver(message);
    }

    // ───────────────────────────────────────────────────────────
    // Errors
    // ───────────────────────────────────────────────────────────

    /// Registers a handler for errors raised off the caller's path.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ListenerError) + Send + Sync + 'static,
    {
        self.inner.errors.on_error(handler);
    }

    pub fn last_error(&self) -> Option<ListenerError> {
        self.inner.errors.last_error()
    }

    /// Receiver side of the fatal-error channel.
    pub fn errors(&self) -> flume::Receiver<ListenerError> {
        self.inner.error_rx.clone()
    }

    // ───────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────

    /// Starts the ack buffer and lease renewal. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> &Self {
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return self;
            }
            state.started = true;
            state.stopped = false;
        }

        self.inner.message_pool.restart();
        self.inner.buffer.start();

        let (cancel, mut cancelled) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let period = self
            .inner
            .config
            .lease
            .renew_interval()
            .max(MIN_TIMER_PERIOD);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.renew_leases();
                    }
                    _ = cancelled.changed() => break,
                }
            }
        });
        *self.inner.lease.lock() = Some(LeaseTimer { cancel, handle });

        info!(subscription = %self.inner.config.subscription, "listener started");
        self
    }

    /// Stops accepting messages, lets in-flight handlers finish, releases
    /// whatever is still held and flushes the ack buffer.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.started = false;
            state.stopped = true;
        }

        self.inner.message_pool.shutdown();
        if let Err(e) = self
            .inner
            .message_pool
            .drain(self.inner.config.listener.shutdown_grace())
            .await
        {
            self.inner.errors.report(e);
        }

        let lease = self.inner.lease.lock().take();
        if let Some(LeaseTimer { cancel, handle }) = lease {
            let _ = cancel.send(true);
            let _ = handle.await;
        }

        let held = self.inner.inventory.drain();
        if !held.is_empty() {
            debug!(count = held.len(), "releasing unsettled messages");
            self.inner.buffer.modify_ack_deadline(0, held, None);
        }

        self.inner.buffer.stop().await;
        info!(subscription = %self.inner.config.subscription, "listener stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }
}
