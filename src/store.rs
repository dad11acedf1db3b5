// Copyright (c) 2025 Quilt Foundation

//! The info store: the authoritative local view of all gossiped values.
//!
//! Every inbound delta is merged here and every outbound delta is extracted
//! from here. The store also answers the topology manager's questions: how
//! far away is the furthest info (`max_hops`), which origins are too far
//! (`distant`), and which outgoing peer has contributed the least
//! (`least_useful`).
//!
//! The store is not synchronized; the owning gossip instance serializes all
//! access under its mutex.

use crate::addr_set::AddrSet;
use crate::error::{GossipError, GossipResult};
use crate::group::{Group, GroupKind};
use crate::info::{merge_record, now_nanos, Info, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Replicated map of info records plus the registered groups.
///
/// Group members are owned by their group; the top-level map holds only
/// ungrouped records. A key therefore maps to at most one record overall,
/// and a group eviction erases the record from the store entirely.
#[derive(Debug)]
pub struct InfoStore {
    node_addr: String,
    infos: BTreeMap<String, Info>,
    groups: Vec<Group>,
    seq_gen: u64,
    credits: HashMap<String, u64>,
}

impl InfoStore {
    /// Create an empty store for the node reachable at `node_addr`.
    pub fn new(node_addr: &str) -> Self {
        Self {
            node_addr: node_addr.to_string(),
            infos: BTreeMap::new(),
            groups: Vec::new(),
            seq_gen: 0,
            credits: HashMap::new(),
        }
    }

    /// The endpoint stamped as origin on locally created infos.
    pub fn node_addr(&self) -> &str {
        &self.node_addr
    }

    pub(crate) fn set_node_addr(&mut self, addr: &str) {
        self.node_addr = addr.to_string();
    }

    fn next_seq(&mut self) -> u64 {
        self.seq_gen += 1;
        self.seq_gen
    }

    /// Construct (but do not insert) a locally originated info record.
    pub fn new_info(&mut self, key: &str, value: Value, ttl: Duration) -> Info {
        let seq = self.next_seq();
        Info {
            key: key.to_string(),
            value,
            timestamp: now_nanos(),
            ttl,
            seq,
            hops: 0,
            node_addr: self.node_addr.clone(),
            peer_addr: String::new(),
        }
    }

    /// Record stored under `key`, expired or not.
    fn lookup(&self, key: &str) -> Option<&Info> {
        match self.group_index(key) {
            Some(idx) => self.groups[idx].get(key),
            None => self.infos.get(key),
        }
    }

    fn group_index(&self, key: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.belongs(key))
    }

    /// Insert or merge a record.
    ///
    /// The incoming record must be fresher than the stored one and, for
    /// group members, make the group's bounded cut. Accepted records are
    /// restamped with this store's next sequence number so delta queries
    /// range over a single monotonic counter.
    pub fn add_info(&mut self, info: Info) -> GossipResult<()> {
        let key = info.key.clone();
        // Keep the local counter ahead of every wire stamp seen, so a stored
        // record always outranks later copies of itself on the seq tie-break.
        self.seq_gen = self.seq_gen.max(info.seq);
        if let Some(existing) = self.lookup(&key) {
            if !existing.value.same_type(&info.value) {
                return Err(GossipError::TypeMismatch(key));
            }
        }

        match self.group_index(&key) {
            Some(idx) => {
                self.groups[idx].try_insert(info)?;
                let seq = self.next_seq();
                if let Some(stored) = self.groups[idx].get_mut(&key) {
                    stored.seq = seq;
                }
            }
            None => {
                match self.infos.get_mut(&key) {
                    Some(stored) => merge_record(stored, info)?,
                    None => {
                        self.infos.insert(key.clone(), info);
                    }
                }
                let seq = self.next_seq();
                if let Some(stored) = self.infos.get_mut(&key) {
                    stored.seq = seq;
                }
            }
        }
        Ok(())
    }

    /// Look up a non-expired record. Expired records are left in place for
    /// the periodic sweep.
    pub fn get_info(&self, key: &str) -> Option<&Info> {
        self.lookup(key).filter(|i| !i.expired(now_nanos()))
    }

    /// Register a bounded group for `prefix`.
    ///
    /// Prefixes must partition cleanly: a prefix that equals, extends, or is
    /// extended by an already registered prefix is rejected. Records already
    /// stored under the prefix migrate into the new group, subject to its
    /// admission policy.
    pub fn register_group(&mut self, prefix: &str, limit: usize, kind: GroupKind) -> GossipResult<()> {
        if prefix.is_empty() {
            return Err(GossipError::GroupConflict(prefix.to_string()));
        }
        for group in &self.groups {
            if group.prefix() == prefix {
                return Err(GossipError::GroupExists(prefix.to_string()));
            }
            if group.prefix().starts_with(prefix) || prefix.starts_with(group.prefix()) {
                return Err(GossipError::GroupConflict(prefix.to_string()));
            }
        }

        let mut group = Group::new(prefix, limit, kind);
        let captured: Vec<String> = self
            .infos
            .keys()
            .filter(|k| group.belongs(k))
            .cloned()
            .collect();
        for key in captured {
            if let Some(record) = self.infos.remove(&key) {
                // Records beyond the group's cut are dropped outright.
                let _ = group.try_insert(record);
            }
        }
        self.groups.push(group);
        Ok(())
    }

    /// Non-expired members of the group registered for `prefix`, in
    /// unspecified order. `None` when no such group exists.
    pub fn group_infos(&self, prefix: &str) -> Option<Vec<Info>> {
        self.groups
            .iter()
            .find(|g| g.prefix() == prefix)
            .map(|g| g.infos(now_nanos()))
    }

    fn all_infos(&self) -> impl Iterator<Item = &Info> {
        self.infos
            .values()
            .chain(self.groups.iter().flat_map(|g| g.members()))
    }

    /// Non-expired records with `seq < r.seq <= max_seq` and
    /// `r.hops <= max_hops`, ascending by sequence number.
    pub fn delta(&self, seq: u64, max_seq: u64, max_hops: u32) -> Vec<Info> {
        let now = now_nanos();
        let mut out: Vec<Info> = self
            .all_infos()
            .filter(|i| i.seq > seq && i.seq <= max_seq && i.hops <= max_hops && !i.expired(now))
            .cloned()
            .collect();
        out.sort_by_key(|i| i.seq);
        out
    }

    /// Maximum hop count over all non-expired records. Zero when empty.
    pub fn max_hops(&self) -> u32 {
        let now = now_nanos();
        self.all_infos()
            .filter(|i| !i.expired(now))
            .map(|i| i.hops)
            .max()
            .unwrap_or(0)
    }

    /// Origin endpoints of non-expired records further than `threshold`
    /// hops. The topology manager dials these to tighten the graph.
    pub fn distant(&self, threshold: u32) -> AddrSet {
        let now = now_nanos();
        let mut set = AddrSet::new(usize::MAX);
        for info in self.all_infos() {
            if info.hops > threshold && !info.expired(now) {
                set.add(&info.node_addr);
            }
        }
        set
    }

    /// Among `candidates`, the outgoing peer credited with the fewest fresh
    /// records. Ties resolve to the lexicographically first address.
    pub fn least_useful(&self, candidates: &AddrSet) -> Option<String> {
        candidates
            .as_slice()
            .iter()
            .min_by_key(|addr| self.credits.get(*addr).copied().unwrap_or(0))
            .cloned()
    }

    /// Credit the session with `peer_addr` for supplying `count` fresh
    /// records. Feeds the `least_useful` accounting.
    pub fn credit_client(&mut self, peer_addr: &str, count: u64) {
        *self.credits.entry(peer_addr.to_string()).or_insert(0) += count;
    }

    /// Drop the credit counter for a closed session.
    pub fn forget_client(&mut self, peer_addr: &str) {
        self.credits.remove(peer_addr);
    }

    /// Remove records expired at `now` from the map and every group.
    pub fn prune_expired(&mut self, now: u64) -> usize {
        let before = self.infos.len();
        self.infos.retain(|_, i| !i.expired(now));
        let mut removed = before - self.infos.len();
        for group in &mut self.groups {
            removed += group.prune_expired(now);
        }
        removed
    }
}
