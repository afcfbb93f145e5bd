//! Batched acknowledgement of received messages.
//!
//! - [`buffer`]: the time-windowed [`AckBuffer`] and its retry handling.
//! - [`memory`]: an in-process backend that records calls.
//! - [`request`]: wire requests and size-capped splitting.
//! - [`result`]: per-message outcomes handed to completion callbacks.
//! - [`service`]: the backend trait the buffer sends through.

pub mod buffer;
pub mod memory;
pub mod request;
pub mod result;
pub mod service;

pub use buffer::{ack_callback, AckBuffer, AckCallback};
pub use memory::{MemoryService, RecordedCall, RpcKind};
pub use request::{AcknowledgeRequest, FlushRequests, ModifyAckDeadlineRequest, PendingAction};
pub use result::{AckResult, AckStatus};
pub use service::{AckService, ServiceError, StatusCode, PERMANENT_FAILURE};
