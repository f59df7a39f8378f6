//! Broker-level partitioning of event subjects
//!
//! Every message carries a partition token as the second subject token:
//! `events.billing.subscription.created` travels as
//! `events.p3.billing.subscription.created`. The token is derived from the
//! ordering key (aggregate ID), so all events of one aggregate share a
//! partition. A durable consumer per partition with a single unacknowledged
//! message in flight then gives per-aggregate ordering across every replica
//! attached to it.
//!
//! The hash is SHA-256 based so that producers and consumers built separately
//! agree on the mapping.

use crate::{BusMessage, HEADER_AGGREGATE_ID, HEADER_MSG_ID};
use sha2::{Digest, Sha256};

/// Partition of `key` among `partitions`
pub fn partition_of(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

/// Ordering key of an outgoing message: aggregate ID, then message ID, then subject
pub fn ordering_key(msg: &BusMessage) -> &str {
    msg.header(HEADER_AGGREGATE_ID)
        .or_else(|| msg.header(HEADER_MSG_ID))
        .unwrap_or(msg.subject.as_str())
}

pub fn partition_token(partition: u32) -> String {
    format!("p{}", partition)
}

/// Insert `token` after the first token of a subject or pattern
///
/// A leading `>` already spans every partition and is returned unchanged.
pub fn insert_token(subject: &str, token: &str) -> String {
    match subject.split_once('.') {
        _ if subject == ">" => subject.to_string(),
        Some((head, rest)) => format!("{}.{}.{}", head, token, rest),
        None => format!("{}.{}", subject, token),
    }
}

/// Wire subject of `msg` when the stream is split into `partitions`
pub fn partitioned_subject(msg: &BusMessage, partitions: u32) -> String {
    let partition = partition_of(ordering_key(msg), partitions);
    insert_token(&msg.subject, &partition_token(partition))
}

/// Filter selecting one partition of a subscription pattern
pub fn partition_filter(pattern: &str, partition: u32) -> String {
    insert_token(pattern, &partition_token(partition))
}

/// Filter selecting every partition of a subscription pattern
pub fn any_partition_filter(pattern: &str) -> String {
    insert_token(pattern, "*")
}

/// Logical subject of a partitioned wire subject
pub fn strip_partition(subject: &str) -> String {
    let mut tokens = subject.splitn(3, '.');
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(head), Some(token), rest) if is_partition_token(token) => match rest {
            Some(rest) => format!("{}.{}", head, rest),
            None => head.to_string(),
        },
        _ => subject.to_string(),
    }
}

fn is_partition_token(token: &str) -> bool {
    token
        .strip_prefix('p')
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(subject: &str, aggregate: Option<&str>) -> BusMessage {
        let mut headers = HashMap::new();
        headers.insert(HEADER_MSG_ID.to_string(), "e-1".to_string());
        if let Some(aggregate) = aggregate {
            headers.insert(HEADER_AGGREGATE_ID.to_string(), aggregate.to_string());
        }
        BusMessage::new(subject.to_string(), vec![]).with_headers(headers)
    }

    #[test]
    fn same_key_always_maps_to_same_partition() {
        for key in ["s1", "sub-42", "tenant-a/coach-9"] {
            let first = partition_of(key, 8);
            assert!(first < 8);
            assert_eq!(partition_of(key, 8), first);
        }
        assert_eq!(partition_of("anything", 1), 0);
        assert_eq!(partition_of("anything", 0), 0);
    }

    #[test]
    fn keys_spread_over_partitions() {
        let used: std::collections::HashSet<u32> =
            (0..64).map(|n| partition_of(&format!("s{}", n), 4)).collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn aggregate_header_drives_the_subject() {
        let a = message("events.billing.subscription.created", Some("s1"));
        let b = message("events.billing.subscription.cancelled", Some("s1"));
        let token = partition_token(partition_of("s1", 8));

        assert_eq!(
            partitioned_subject(&a, 8),
            format!("events.{}.billing.subscription.created", token)
        );
        assert_eq!(
            partitioned_subject(&b, 8),
            format!("events.{}.billing.subscription.cancelled", token)
        );

        let bare = message("events.community.message.sent", None);
        assert_eq!(ordering_key(&bare), "e-1");
    }

    #[test]
    fn filters_follow_the_subject_layout() {
        assert_eq!(
            partition_filter("events.billing.subscription.>", 2),
            "events.p2.billing.subscription.>"
        );
        assert_eq!(
            any_partition_filter("events.billing.>"),
            "events.*.billing.>"
        );
        assert_eq!(partition_filter("*.billing.>", 0), "*.p0.billing.>");
        assert_eq!(partition_filter(">", 1), ">");
    }

    #[test]
    fn strip_restores_the_logical_subject() {
        assert_eq!(
            strip_partition("events.p13.billing.subscription.created"),
            "events.billing.subscription.created"
        );
        assert_eq!(strip_partition("events.p0"), "events");
        assert_eq!(
            strip_partition("events.billing.subscription.created"),
            "events.billing.subscription.created"
        );
        assert_eq!(strip_partition("events.px.a.b"), "events.px.a.b");
    }
}
