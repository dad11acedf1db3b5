// Copyright (c) 2025 Quilt Foundation

//! Bounded collections of info records sharing a key prefix.
//!
//! Groups keep the gossip network from carrying an unbounded number of
//! records for high-cardinality keys (per-node load, capacity, and the
//! like): only the `limit` best-ranked members survive. Group members are
//! owned here, not in the store's top-level map, so evicting a member
//! removes it from the info store entirely.

use crate::error::{GossipError, GossipResult};
use crate::info::{merge_record, Info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Which end of the value ordering a group retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    /// Retain the records with the smallest values.
    Min,
    /// Retain the records with the largest values.
    Max,
}

/// A registered, bounded collection of infos under a common key prefix.
#[derive(Debug, Clone)]
pub struct Group {
    prefix: String,
    limit: usize,
    kind: GroupKind,
    members: BTreeMap<String, Info>,
}

/// Rank members by `(value, key)`; the key breaks value ties.
fn rank(a: &Info, b: &Info) -> Ordering {
    a.value
        .cmp_same_type(&b.value)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.key.cmp(&b.key))
}

impl Group {
    /// Create a group retaining at most `limit` records (floored at one).
    pub fn new(prefix: &str, limit: usize, kind: GroupKind) -> Self {
        Self {
            prefix: prefix.to_string(),
            limit: limit.max(1),
            kind,
            members: BTreeMap::new(),
        }
    }

    /// The group's key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maximum number of retained members.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Which end of the ordering this group retains.
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Whether `key` belongs to this group: the prefix must be a strict
    /// prefix of the key.
    pub fn belongs(&self, key: &str) -> bool {
        key.len() > self.prefix.len() && key.starts_with(&self.prefix)
    }

    /// Look up a member by full key.
    pub fn get(&self, key: &str) -> Option<&Info> {
        self.members.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Info> {
        self.members.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Info> {
        self.members.remove(key)
    }

    pub(crate) fn members(&self) -> impl Iterator<Item = &Info> {
        self.members.values()
    }

    /// Drop members expired at `now`, returning how many were removed.
    pub(crate) fn prune_expired(&mut self, now: u64) -> usize {
        let before = self.members.len();
        self.members.retain(|_, i| !i.expired(now));
        before - self.members.len()
    }

    /// Number of members currently retained.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Non-expired members at time `now`, in unspecified order.
    pub fn infos(&self, now: u64) -> Vec<Info> {
        self.members
            .values()
            .filter(|i| !i.expired(now))
            .cloned()
            .collect()
    }

    /// The member that would be evicted next: the worst-ranked one.
    fn boundary(&self) -> Option<&Info> {
        match self.kind {
            GroupKind::Min => self.members.values().max_by(|a, b| rank(a, b)),
            GroupKind::Max => self.members.values().min_by(|a, b| rank(a, b)),
        }
    }

    /// Whether `info` ranks strictly better than the current boundary.
    fn beats_boundary(&self, info: &Info) -> bool {
        match self.boundary() {
            Some(boundary) => match self.kind {
                GroupKind::Min => rank(info, boundary) == Ordering::Less,
                GroupKind::Max => rank(info, boundary) == Ordering::Greater,
            },
            None => true,
        }
    }

    /// Admit `info` into the group.
    ///
    /// Existing members are updated subject to the freshness rule. New
    /// members are admitted while there is room; at capacity they must
    /// strictly beat the boundary member, which is then evicted. Values
    /// must match the type pinned by the first admitted member.
    pub fn try_insert(&mut self, info: Info) -> GossipResult<()> {
        if let Some(member) = self.members.values().next() {
            if !member.value.same_type(&info.value) {
                return Err(GossipError::TypeMismatch(info.key));
            }
        }

        if let Some(stored) = self.members.get_mut(&info.key) {
            return merge_record(stored, info);
        }

        if self.members.len() >= self.limit {
            if !self.beats_boundary(&info) {
                return Err(GossipError::GroupFull(info.key));
            }
            if let Some(worst) = self.boundary().map(|i| i.key.clone()) {
                self.members.remove(&worst);
            }
        }
        self.members.insert(info.key.clone(), info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::Value;
    use std::time::Duration;

    fn load_info(key: &str, value: i64, seq: u64) -> Info {
        Info {
            key: key.to_string(),
            value: Value::Int64(value),
            timestamp: seq * 100,
            ttl: Duration::ZERO,
            seq,
            hops: 0,
            node_addr: "origin:9000".to_string(),
            peer_addr: String::new(),
        }
    }

    fn member_values(group: &Group) -> Vec<(String, i64)> {
        group
            .members()
            .map(|i| {
                let v = match i.value {
                    Value::Int64(v) => v,
                    _ => panic!("unexpected value type"),
                };
                (i.key.clone(), v)
            })
            .collect()
    }

    #[test]
    fn test_belongs_is_strict_prefix() {
        let group = Group::new("load.", 2, GroupKind::Min);
        assert!(group.belongs("load.a"));
        assert!(!group.belongs("load."));
        assert!(!group.belongs("capacity.a"));
    }

    #[test]
    fn test_min_group_retains_smallest() {
        let mut group = Group::new("load.", 2, GroupKind::Min);
        group.try_insert(load_info("load.a", 5, 1)).unwrap();
        group.try_insert(load_info("load.b", 3, 2)).unwrap();
        group.try_insert(load_info("load.c", 9, 3)).unwrap_err();
        assert_eq!(
            member_values(&group),
            vec![("load.a".to_string(), 5), ("load.b".to_string(), 3)]
        );

        // A smaller value displaces the current boundary (load.a).
        group.try_insert(load_info("load.d", 1, 4)).unwrap();
        assert_eq!(
            member_values(&group),
            vec![("load.b".to_string(), 3), ("load.d".to_string(), 1)]
        );
    }

    #[test]
    fn test_max_group_retains_largest() {
        let mut group = Group::new("cap.", 2, GroupKind::Max);
        group.try_insert(load_info("cap.a", 10, 1)).unwrap();
        group.try_insert(load_info("cap.b", 20, 2)).unwrap();

        let err = group.try_insert(load_info("cap.c", 5, 3)).unwrap_err();
        assert!(matches!(err, GossipError::GroupFull(_)));

        group.try_insert(load_info("cap.d", 30, 4)).unwrap();
        assert_eq!(
            member_values(&group),
            vec![("cap.b".to_string(), 20), ("cap.d".to_string(), 30)]
        );
    }

    #[test]
    fn test_value_ties_break_on_key() {
        let mut group = Group::new("load.", 1, GroupKind::Min);
        group.try_insert(load_info("load.b", 7, 1)).unwrap();

        // Equal value, lexicographically smaller key wins in a min group.
        group.try_insert(load_info("load.a", 7, 2)).unwrap();
        assert_eq!(member_values(&group), vec![("load.a".to_string(), 7)]);

        // Equal value, larger key does not.
        group.try_insert(load_info("load.z", 7, 3)).unwrap_err();
    }

    #[test]
    fn test_member_update_respects_freshness() {
        let mut group = Group::new("load.", 2, GroupKind::Min);
        group.try_insert(load_info("load.a", 5, 3)).unwrap();

        // An older record for the same key is rejected.
        let err = group.try_insert(load_info("load.a", 4, 1)).unwrap_err();
        assert!(matches!(err, GossipError::Stale(_)));

        // A fresher record replaces in place without an eviction check.
        group.try_insert(load_info("load.a", 8, 4)).unwrap();
        assert_eq!(member_values(&group), vec![("load.a".to_string(), 8)]);
    }

    #[test]
    fn test_type_is_pinned_by_first_member() {
        let mut group = Group::new("load.", 4, GroupKind::Min);
        group.try_insert(load_info("load.a", 5, 1)).unwrap();

        let mut other = load_info("load.b", 0, 2);
        other.value = Value::Text("oops".to_string());
        let err = group.try_insert(other).unwrap_err();
        assert!(matches!(err, GossipError::TypeMismatch(_)));
    }

    #[test]
    fn test_limit_floor() {
        let group = Group::new("load.", 0, GroupKind::Min);
        assert_eq!(group.limit(), 1);
    }
}
