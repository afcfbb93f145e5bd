//! pubsub-listener – the delivery core of a streaming Pub/Sub subscriber.
//!
//! This crate exports
//!  * `core`    – ordered sequencing, the ack buffer and the listener
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! Transport is out of scope: the backend is reached through the
//! [`AckService`] trait and messages are fed in with
//! [`MessageListener::deliver`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod util;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, parse_config, Config};
pub use crate::core::ack::{
    ack_callback, AckBuffer, AckCallback, AckResult, AckService, AckStatus, ServiceError,
    StatusCode,
};
pub use crate::core::error::{ListenerError, SequencerError};
pub use crate::core::listener::{MessageHandler, MessageListener, ReceivedMessage};
pub use crate::core::message::{Message, Sequenced};
pub use crate::core::sequencer::Sequencer;
