use std::fmt;

use crate::core::ack::service::{ServiceError, StatusCode};

/// Outcome category of an acknowledge or modify-deadline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStatus {
    Success,
    PermissionDenied,
    FailedPrecondition,
    InvalidAckId,
    Other,
}

/// Terminal result delivered to a per-message completion callback.
#[derive(Debug, Clone, PartialEq)]
pub struct AckResult {
    status: AckStatus,
    error: Option<ServiceError>,
}

impl AckResult {
    pub fn success() -> Self {
        Self {
            status: AckStatus::Success,
            error: None,
        }
    }

    /// Classifies a backend failure.
    pub fn from_error(error: ServiceError) -> Self {
        let status = match error.code {
            StatusCode::PermissionDenied => AckStatus::PermissionDenied,
            StatusCode::FailedPrecondition => AckStatus::FailedPrecondition,
            StatusCode::InvalidArgument => AckStatus::InvalidAckId,
            _ => AckStatus::Other,
        };
        Self {
            status,
            error: Some(error),
        }
    }

    /// A failure that is reported as `Other` regardless of its code, used
    /// when the retry budget runs out.
    pub fn exhausted(error: ServiceError) -> Self {
        Self {
            status: AckStatus::Other,
            error: Some(error),
        }
    }

    #[inline]
    pub fn status(&self) -> AckStatus {
        self.status
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }

    pub fn error(&self) -> Option<&ServiceError> {
        self.error.as_ref()
    }
}

impl fmt::Display for AckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{:?}", self.status),
            Some(e) => write!(f, "{:?}: {e}", self.status),
        }
    }
}
