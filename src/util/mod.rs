//! Small runtime helpers shared across the listener.

pub mod backoff;

pub use backoff::ExponentialBackoff;
