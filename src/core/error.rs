//! Error types for the listener core.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{error, warn};

/// Contract violations detected by the [`Sequencer`](crate::core::sequencer::Sequencer).
///
/// These are programming errors in the caller, never transient conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("ordered delivery violated for key {ordering_key:?}: {ack_id} is not at the head of the queue")]
    OutOfOrder {
        ordering_key: String,
        ack_id: String,
    },
}

/// Errors surfaced on the listener's fatal-error channel.
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error("acknowledgement callback failed: {0}")]
    Callback(String),

    #[error("message callback failed for {ack_id}: {reason}")]
    MessageCallback { ack_id: String, reason: String },

    #[error("timeout making subscriber API calls")]
    DispatchTimeout,

    #[error("worker pool {0} did not drain before the shutdown deadline")]
    PoolShutdownTimeout(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Renders a caught panic payload for error reporting.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Handler registered through [`ErrorSink::on_error`].
pub type ErrorHandler = Arc<dyn Fn(&ListenerError) + Send + Sync>;

/// Fan-out point for errors that cannot be returned to a caller.
///
/// Every report is logged, remembered as the last error, passed to each
/// registered handler and queued on a bounded channel for polling.
#[derive(Clone)]
pub struct ErrorSink {
    tx: flume::Sender<ListenerError>,
    handlers: Arc<RwLock<Vec<ErrorHandler>>>,
    last: Arc<Mutex<Option<ListenerError>>>,
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("handlers", &self.handlers.read().len())
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl ErrorSink {
    pub fn new(capacity: usize) -> (Self, flume::Receiver<ListenerError>) {
        let (tx, rx) = flume::bounded(capacity);
        let sink = Self {
            tx,
            handlers: Arc::new(RwLock::new(Vec::new())),
            last: Arc::new(Mutex::new(None)),
        };
        (sink, rx)
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ListenerError) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn last_error(&self) -> Option<ListenerError> {
        self.last.lock().clone()
    }

    pub fn report(&self, err: ListenerError) {
        error!(error = %err, "listener error");
        *self.last.lock() = Some(err.clone());

        let handlers: Vec<ErrorHandler> = self.handlers.read().clone();
        for handler in handlers {
            handler(&err);
        }

        if self.tx.try_send(err).is_err() {
            warn!("error channel full or closed, dropping report");
        }
    }
}
