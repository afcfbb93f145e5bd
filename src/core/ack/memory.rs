//! In-process [`AckService`] that records every call.
//!
//! Failures can be scripted per RPC kind; each queued error is returned by
//! the next matching call, after which calls succeed again.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::ack::service::{AckService, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Acknowledge,
    ModifyAckDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub kind: RpcKind,
    pub subscription: String,
    pub ack_ids: Vec<String>,
    pub ack_deadline_seconds: Option<i32>,
}

#[derive(Debug, Default)]
pub struct MemoryService {
    calls: Mutex<Vec<RecordedCall>>,
    ack_failures: Mutex<VecDeque<ServiceError>>,
    modack_failures: Mutex<VecDeque<ServiceError>>,
    latency: Duration,
    changed: Notify,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn fail_next_acknowledge(&self, err: ServiceError) {
        self.ack_failures.lock().push_back(err);
    }

    pub fn fail_next_modify_ack_deadline(&self, err: ServiceError) {
        self.modack_failures.lock().push_back(err);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every id sent in an acknowledge call, failed attempts included.
    pub fn acknowledged_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.kind == RpcKind::Acknowledge)
            .flat_map(|c| c.ack_ids.iter().cloned())
            .collect()
    }

    /// Waits until at least `count` calls were recorded.
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.call_count() >= count {
                return;
            }
            notified.await;
        }
    }

    fn record(
        &self,
        kind: RpcKind,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: Option<i32>,
    ) -> Result<(), ServiceError> {
        self.calls.lock().push(RecordedCall {
            kind,
            subscription: subscription.to_owned(),
            ack_ids,
            ack_deadline_seconds,
        });
        self.changed.notify_waiters();

        let failure = match kind {
            RpcKind::Acknowledge => self.ack_failures.lock().pop_front(),
            RpcKind::ModifyAckDeadline => self.modack_failures.lock().pop_front(),
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AckService for MemoryService {
    async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> Result<(), ServiceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.record(RpcKind::Acknowledge, subscription, ack_ids, None)
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> Result<(), ServiceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.record(
            RpcKind::ModifyAckDeadline,
            subscription,
            ack_ids,
            Some(ack_deadline_seconds),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ack::service::StatusCode;

    #[tokio::test]
    async fn scripted_failures_apply_once() {
        let svc = MemoryService::new();
        svc.fail_next_acknowledge(ServiceError::new(StatusCode::Internal, "boom"));

        let first = svc.acknowledge("s", vec!["a".into()]).await;
        assert_eq!(first.unwrap_err().code, StatusCode::Internal);
        assert!(svc.acknowledge("s", vec!["a".into()]).await.is_ok());
        assert!(svc.modify_ack_deadline("s", vec!["b".into()], 10).await.is_ok());

        assert_eq!(svc.call_count(), 3);
        assert_eq!(svc.acknowledged_ids(), vec!["a", "a"]);
        assert_eq!(svc.calls()[2].ack_deadline_seconds, Some(10));
    }
}
