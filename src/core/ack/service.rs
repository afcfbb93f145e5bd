//! The backend seam: whatever actually carries acks to the service.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Marker the backend puts in per-id error metadata for failures that will
/// never succeed on retry.
pub const PERMANENT_FAILURE: &str = "PERMANENT_FAILURE";

/// Canonical status codes the buffer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl StatusCode {
    /// Codes after which an exactly-once subscription may still accept the
    /// same ids. `Unavailable` is retried by the transport layer already.
    pub fn is_exactly_once_retriable(self) -> bool {
        matches!(
            self,
            StatusCode::Cancelled
                | StatusCode::DeadlineExceeded
                | StatusCode::Internal
                | StatusCode::ResourceExhausted
                | StatusCode::InvalidArgument
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed backend call, optionally carrying per-ack-id failure reasons.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: StatusCode,
    pub message: String,
    pub metadata: Option<HashMap<String, String>>,
}

impl ServiceError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata = Some(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }
}

/// Unary acknowledgement RPCs of a subscription backend.
#[async_trait]
pub trait AckService: Send + Sync {
    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>)
        -> Result<(), ServiceError>;

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> Result<(), ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_set() {
        assert!(StatusCode::Internal.is_exactly_once_retriable());
        assert!(StatusCode::InvalidArgument.is_exactly_once_retriable());
        assert!(!StatusCode::PermissionDenied.is_exactly_once_retriable());
        assert!(!StatusCode::Unavailable.is_exactly_once_retriable());
    }

    #[test]
    fn metadata_builder() {
        let err = ServiceError::new(StatusCode::Internal, "oops")
            .with_metadata([("a", PERMANENT_FAILURE), ("b", "TRANSIENT_FAILURE_UNORDERED_ACK_ID")]);
        let md = err.metadata.unwrap();
        assert_eq!(md.len(), 2);
        assert_eq!(md["a"], PERMANENT_FAILURE);
    }
}
