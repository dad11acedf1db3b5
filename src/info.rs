// Copyright (c) 2025 Quilt Foundation

//! The info record: a single keyed value in the gossip store.
//!
//! Infos carry everything a peer needs to merge them: the origin timestamp
//! and TTL for expiry, the store-local sequence number driving delta pulls,
//! the hop count measuring distance from the origin, and the origin and
//! disseminating endpoints.

use crate::error::{GossipError, GossipResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A gossiped value: a tagged sum over the three supported payload types.
///
/// Ordering is defined only between values of the same variant; groups use
/// it to rank their members. Floats are ordered with `f64::total_cmp` so a
/// stray NaN cannot poison a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Signed 64-bit integer
    Int64(i64),
    /// 64-bit float
    Float64(f64),
    /// UTF-8 string
    Text(String),
}

impl Value {
    /// Whether `other` is the same variant as `self`.
    pub fn same_type(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Compare two values of the same variant. `None` across variants.
    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float64(a), Value::Float64(b)) => Some(a.total_cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Human-readable name of the variant, for error reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::Text(_) => "string",
        }
    }
}

/// A single keyed record in the gossip store.
///
/// This is also the wire representation: deltas are arrays of these. The
/// `seq` field is local to the store that most recently accepted the record;
/// receivers restamp it on merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    /// Unique key within an info store.
    pub key: String,

    /// The gossiped payload.
    pub value: Value,

    /// Nanoseconds since the Unix epoch, set once at the origin.
    pub timestamp: u64,

    /// Time to live measured from `timestamp`. Zero means non-expiring.
    pub ttl: Duration,

    /// Store-local sequence number, restamped on every accepted insert.
    pub seq: u64,

    /// Number of peer-to-peer merges from the origin to here. Zero at origin.
    pub hops: u32,

    /// Endpoint of the originating node.
    pub node_addr: String,

    /// Endpoint of the neighbor this record was most recently learned from.
    /// Empty at the origin.
    pub peer_addr: String,
}

impl Info {
    /// Whether the record is expired at `now` (nanoseconds since epoch).
    pub fn expired(&self, now: u64) -> bool {
        !self.ttl.is_zero() && now >= self.timestamp.saturating_add(self.ttl.as_nanos() as u64)
    }

    /// Whether this record is strictly fresher than `other`, by the
    /// `(timestamp, seq)` lexicographic rule.
    pub fn fresher_than(&self, other: &Info) -> bool {
        (self.timestamp, self.seq) > (other.timestamp, other.seq)
    }
}

/// Merge `incoming` into the stored record for the same key.
///
/// A record with a higher timestamp replaces the stored one wholesale, hop
/// count included. On equal timestamps the sequence number breaks the tie,
/// but only sideways or downward in hop count: a copy of the same payload
/// that arrived over a longer path must never push the stored hop count up.
/// An equal-timestamp copy that traveled strictly fewer hops keeps the
/// stored stamp but adopts the shorter path; the merge still reports
/// [`GossipError::Stale`] so re-applied deltas are never counted as new.
pub(crate) fn merge_record(stored: &mut Info, incoming: Info) -> GossipResult<()> {
    if incoming.timestamp > stored.timestamp
        || (incoming.timestamp == stored.timestamp
            && incoming.seq > stored.seq
            && incoming.hops <= stored.hops)
    {
        *stored = incoming;
        return Ok(());
    }
    let key = incoming.key;
    if incoming.timestamp == stored.timestamp && incoming.hops < stored.hops {
        stored.hops = incoming.hops;
        stored.peer_addr = incoming.peer_addr;
    }
    Err(GossipError::Stale(key))
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(key: &str, timestamp: u64, seq: u64, hops: u32) -> Info {
        Info {
            key: key.to_string(),
            value: Value::Int64(1),
            timestamp,
            ttl: Duration::ZERO,
            seq,
            hops,
            node_addr: "origin:9000".to_string(),
            peer_addr: String::new(),
        }
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(
            Value::Int64(3).cmp_same_type(&Value::Int64(7)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Float64(2.5).cmp_same_type(&Value::Float64(2.5)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Text("b".into()).cmp_same_type(&Value::Text("a".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int64(1).cmp_same_type(&Value::Float64(1.0)), None);
        assert!(!Value::Int64(1).same_type(&Value::Text("1".into())));
    }

    #[test]
    fn test_expiry() {
        let mut info = make_info("k", 1_000, 1, 0);
        info.ttl = Duration::from_nanos(500);
        assert!(!info.expired(1_499));
        assert!(info.expired(1_500));
        assert!(info.expired(2_000));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let info = make_info("k", 1_000, 1, 0);
        assert!(!info.expired(u64::MAX));
    }

    #[test]
    fn test_freshness_ordering() {
        let a = make_info("k", 100, 5, 0);
        let b = make_info("k", 200, 1, 0);
        assert!(b.fresher_than(&a));
        assert!(!a.fresher_than(&b));

        // Equal timestamps fall back to the sequence number.
        let c = make_info("k", 100, 6, 0);
        assert!(c.fresher_than(&a));
        assert!(!a.fresher_than(&a.clone()));
    }

    #[test]
    fn test_merge_replaces_fresher() {
        let mut stored = make_info("k", 100, 5, 1);
        let incoming = make_info("k", 200, 2, 3);
        assert!(merge_record(&mut stored, incoming).is_ok());
        assert_eq!(stored.timestamp, 200);
        assert_eq!(stored.hops, 3);
    }

    #[test]
    fn test_merge_seq_tie_break() {
        // Equal timestamps: the higher sequence number wins, provided the
        // hop count does not grow.
        let mut stored = make_info("k", 100, 5, 0);
        let incoming = make_info("k", 100, 6, 0);
        assert!(merge_record(&mut stored, incoming).is_ok());
        assert_eq!(stored.seq, 6);

        // A same-payload copy over a longer path never replaces.
        let longer = make_info("k", 100, 7, 3);
        assert!(merge_record(&mut stored, longer).is_err());
        assert_eq!(stored.hops, 0);
    }

    #[test]
    fn test_merge_adopts_shorter_path() {
        let mut stored = make_info("k", 100, 9, 4);
        let mut incoming = make_info("k", 100, 3, 2);
        incoming.peer_addr = "peer-b:9000".to_string();

        let err = merge_record(&mut stored, incoming).unwrap_err();
        assert!(matches!(err, GossipError::Stale(_)));
        assert_eq!(stored.hops, 2);
        assert_eq!(stored.peer_addr, "peer-b:9000");
        // Payload and stamp are untouched.
        assert_eq!(stored.seq, 9);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut stored = make_info("k", 100, 9, 2);
        let duplicate = make_info("k", 100, 3, 2);
        let before = stored.clone();
        assert!(merge_record(&mut stored, duplicate).is_err());
        assert_eq!(stored, before);
    }

    #[test]
    fn test_wire_round_trip() {
        let mut info = make_info("load.cpu", 42, 7, 1);
        info.value = Value::Float64(0.75);
        info.ttl = Duration::from_secs(10);
        info.peer_addr = "peer:9000".to_string();

        let bytes = serde_json::to_vec(&info).unwrap();
        let back: Info = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, info);
    }
}
