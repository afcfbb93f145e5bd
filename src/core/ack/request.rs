//! Request messages for the unary ack RPCs and size-capped batching.
//!
//! Field numbers match the public Pub/Sub API so `encoded_len` reflects the
//! bytes actually put on the wire.

use prost::encoding::{encoded_len_varint, key_len};
use prost::Message as _;

/// What to send for an ack id at the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Ack,
    ModifyDeadline(i32),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcknowledgeRequest {
    #[prost(string, tag = "1")]
    pub subscription: String,
    #[prost(string, repeated, tag = "2")]
    pub ack_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModifyAckDeadlineRequest {
    #[prost(string, tag = "1")]
    pub subscription: String,
    #[prost(int32, tag = "3")]
    pub ack_deadline_seconds: i32,
    #[prost(string, repeated, tag = "4")]
    pub ack_ids: Vec<String>,
}

const ACK_IDS_TAG: u32 = 2;
const MODACK_IDS_TAG: u32 = 4;

/// Requests produced by one flush.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushRequests {
    pub acknowledge: Vec<AcknowledgeRequest>,
    pub modify_ack_deadline: Vec<ModifyAckDeadlineRequest>,
}

impl FlushRequests {
    /// Builds requests from drained `(ack_id, action)` pairs, in order.
    ///
    /// Modify-deadline ids are grouped by deadline, groups ordered by first
    /// appearance.
    pub fn build<I>(subscription: &str, entries: I, max_bytes: usize) -> Self
    where
        I: IntoIterator<Item = (String, PendingAction)>,
    {
        let mut acks = Vec::new();
        let mut modacks: Vec<(i32, Vec<String>)> = Vec::new();

        for (ack_id, action) in entries {
            match action {
                PendingAction::Ack => acks.push(ack_id),
                PendingAction::ModifyDeadline(deadline) => {
                    match modacks.iter_mut().find(|(d, _)| *d == deadline) {
                        Some((_, ids)) => ids.push(ack_id),
                        None => modacks.push((deadline, vec![ack_id])),
                    }
                }
            }
        }

        let acknowledge = if acks.is_empty() {
            Vec::new()
        } else {
            acknowledge_requests(subscription, acks, max_bytes)
        };
        let modify_ack_deadline = modacks
            .into_iter()
            .flat_map(|(deadline, ids)| {
                modify_ack_deadline_requests(subscription, deadline, ids, max_bytes)
            })
            .collect();

        Self {
            acknowledge,
            modify_ack_deadline,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.acknowledge.is_empty() && self.modify_ack_deadline.is_empty()
    }

    pub fn len(&self) -> usize {
        self.acknowledge.len() + self.modify_ack_deadline.len()
    }
}

pub fn acknowledge_requests(
    subscription: &str,
    ack_ids: Vec<String>,
    max_bytes: usize,
) -> Vec<AcknowledgeRequest> {
    let base = AcknowledgeRequest {
        subscription: subscription.to_owned(),
        ack_ids: Vec::new(),
    };
    split_ids(base.encoded_len(), ACK_IDS_TAG, ack_ids, max_bytes)
        .into_iter()
        .map(|ack_ids| AcknowledgeRequest {
            subscription: subscription.to_owned(),
            ack_ids,
        })
        .collect()
}

pub fn modify_ack_deadline_requests(
    subscription: &str,
    ack_deadline_seconds: i32,
    ack_ids: Vec<String>,
    max_bytes: usize,
) -> Vec<ModifyAckDeadlineRequest> {
    let base = ModifyAckDeadlineRequest {
        subscription: subscription.to_owned(),
        ack_deadline_seconds,
        ack_ids: Vec::new(),
    };
    split_ids(base.encoded_len(), MODACK_IDS_TAG, ack_ids, max_bytes)
        .into_iter()
        .map(|ack_ids| ModifyAckDeadlineRequest {
            subscription: subscription.to_owned(),
            ack_deadline_seconds,
            ack_ids,
        })
        .collect()
}

/// Greedily packs ids into batches whose encoded request stays within
/// `max_bytes`. An id too large to fit anywhere travels alone.
fn split_ids(base_len: usize, tag: u32, ack_ids: Vec<String>, max_bytes: usize) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut size = base_len;

    for id in ack_ids {
        let cost = key_len(tag) + encoded_len_varint(id.len() as u64) + id.len();
        if !current.is_empty() && size + cost > max_bytes {
            batches.push(std::mem::take(&mut current));
            size = base_len;
        }
        size += cost;
        current.push(id);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUB: &str = "projects/p/subscriptions/s";

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ack-id-{i:04}")).collect()
    }

    #[test]
    fn small_batch_is_one_request() {
        let reqs = acknowledge_requests(SUB, vec!["a".into(), "b".into()], 500_000);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].ack_ids, vec!["a", "b"]);
    }

    #[test]
    fn oversized_batch_is_split_in_order() {
        let all = ids(100);
        let max_bytes = 300;
        let reqs = acknowledge_requests(SUB, all.clone(), max_bytes);
        assert!(reqs.len() > 1);
        for req in &reqs {
            assert!(req.encoded_len() <= max_bytes, "{} > {max_bytes}", req.encoded_len());
        }
        let joined: Vec<String> = reqs.into_iter().flat_map(|r| r.ack_ids).collect();
        assert_eq!(joined, all);
    }

    #[test]
    fn modack_split_respects_cap() {
        let all = ids(50);
        let reqs = modify_ack_deadline_requests(SUB, 30, all.clone(), 200);
        assert!(reqs.len() > 1);
        assert!(reqs.iter().all(|r| r.encoded_len() <= 200 && r.ack_deadline_seconds == 30));
        let joined: Vec<String> = reqs.into_iter().flat_map(|r| r.ack_ids).collect();
        assert_eq!(joined, all);
    }

    #[test]
    fn build_partitions_by_action() {
        let entries = vec![
            ("a".to_string(), PendingAction::Ack),
            ("b".to_string(), PendingAction::ModifyDeadline(10)),
            ("c".to_string(), PendingAction::ModifyDeadline(0)),
            ("d".to_string(), PendingAction::ModifyDeadline(10)),
            ("e".to_string(), PendingAction::Ack),
        ];
        let reqs = FlushRequests::build(SUB, entries, 500_000);
        assert_eq!(reqs.acknowledge.len(), 1);
        assert_eq!(reqs.acknowledge[0].ack_ids, vec!["a", "e"]);
        assert_eq!(reqs.modify_ack_deadline.len(), 2);
        assert_eq!(reqs.modify_ack_deadline[0].ack_deadline_seconds, 10);
        assert_eq!(reqs.modify_ack_deadline[0].ack_ids, vec!["b", "d"]);
        assert_eq!(reqs.modify_ack_deadline[1].ack_ids, vec!["c"]);
        assert_eq!(reqs.len(), 3);
    }

    #[test]
    fn empty_input_builds_nothing() {
        let reqs = FlushRequests::build(SUB, Vec::new(), 500_000);
        assert!(reqs.is_empty());
    }
}
