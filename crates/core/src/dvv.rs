//! Dotted version vectors for causal versioning.
//!
//! A [`Dvv`] is the versioned container stored under every key: per-vnode
//! counters plus the values written at individual dots. Unlike a plain
//! version vector it can tell a value that was *overwritten* apart from a
//! value that was *never seen*, so merging two replicas keeps exactly the
//! concurrent siblings and drops everything causally dominated.
//!
//! Clients never see dots. They see the [`VersionVector`] projection
//! ([`Dvv::join`]) as an opaque context and echo it on writes to declare
//! what they had read.

use dotkv_common::{Dot, VnodeId};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// VersionVector
// ---------------------------------------------------------------------------

/// A value-less clock: max counter per vnode. Used as the client context
/// and as the per-vnode node clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    entries: BTreeMap<VnodeId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a vnode (0 if absent).
    pub fn get(&self, id: &VnodeId) -> u64 {
        self.entries.get(id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, id: VnodeId, counter: u64) {
        self.entries.insert(id, counter);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VnodeId, &u64)> {
        self.entries.iter()
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &Self) {
        for (id, &n) in &other.entries {
            let entry = self.entries.entry(*id).or_insert(0);
            *entry = (*entry).max(n);
        }
    }

    /// True iff every counter in `self` is <= the matching counter in
    /// `other` and at least one is strictly smaller.
    pub fn strictly_dominated_by(&self, other: &Self) -> bool {
        let below = self.entries.iter().all(|(id, &n)| n <= other.get(id));
        let strict = other
            .entries
            .iter()
            .any(|(id, &n)| n > self.get(id));
        below && strict
    }
}

impl FromIterator<(VnodeId, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (VnodeId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A stored value or the delete sentinel.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Data(Vec<u8>),
    Tombstone,
}

impl Value {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(bytes) => Some(bytes),
            Value::Tombstone => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Data(bytes) => write!(f, "Data({})", String::from_utf8_lossy(bytes)),
            Value::Tombstone => write!(f, "Tombstone"),
        }
    }
}

/// A value tagged with the counter half of its dot; the vnode half is the
/// entry key it lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DottedValue {
    pub counter: u64,
    pub value: Value,
}

// ---------------------------------------------------------------------------
// Dvv
// ---------------------------------------------------------------------------

/// Per-vnode slice of a clock: the max counter seen from that vnode plus
/// the values still live at specific dots. `max` always covers every
/// counter in `values`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Entry {
    max: u64,
    values: Vec<DottedValue>, // ascending by counter
}

/// A dotted-version-vector clock with its values: the causal object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dvv {
    entries: BTreeMap<VnodeId, Entry>,
    anonymous: Vec<Value>,
}

impl Dvv {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the clock records no causal history and no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.anonymous.is_empty()
    }

    /// Max counter seen from a vnode (0 if absent).
    pub fn max_counter(&self, id: &VnodeId) -> u64 {
        self.entries.get(id).map(|e| e.max).unwrap_or(0)
    }

    /// The context: max counter per vnode, values stripped.
    pub fn join(&self) -> VersionVector {
        self.entries.iter().map(|(id, e)| (*id, e.max)).collect()
    }

    /// The surviving client-visible values as a sorted set. Tombstones
    /// are suppressed, so an object holding only a delete sentinel yields
    /// an empty list. Deduplicated because every replica dots the same
    /// logical write independently.
    pub fn values(&self) -> Vec<&[u8]> {
        let mut out: Vec<&[u8]> = self
            .dotted()
            .map(|(_, v)| v)
            .chain(self.anonymous.iter())
            .filter_map(|v| v.as_data())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Every dotted value, tombstones included.
    pub fn dotted(&self) -> impl Iterator<Item = (Dot, &Value)> {
        self.entries.iter().flat_map(|(id, e)| {
            e.values
                .iter()
                .map(move |dv| (Dot::new(*id, dv.counter), &dv.value))
        })
    }

    /// Number of live dotted values (tombstones included).
    pub fn dotted_len(&self) -> usize {
        self.entries.values().map(|e| e.values.len()).sum()
    }

    /// Record a new write: discard whatever `ctx` proves the writer had
    /// already seen, then tag `value` with a fresh dot from `id`.
    ///
    /// The resulting clock strictly dominates `ctx`: the context's
    /// counters are absorbed into the entry maxes and the fresh dot goes
    /// one past them.
    pub fn update(mut self, ctx: &VersionVector, value: Value, id: VnodeId) -> Dvv {
        // Drop values the context dominates.
        for (vid, entry) in self.entries.iter_mut() {
            let seen = ctx.get(vid);
            entry.values.retain(|dv| dv.counter > seen);
        }
        // Absorb the context into the causal history.
        for (vid, &n) in ctx.iter() {
            let entry = self.entries.entry(*vid).or_default();
            entry.max = entry.max.max(n);
        }
        // Assign the fresh dot.
        let entry = self.entries.entry(id).or_default();
        let counter = entry.max + 1;
        entry.max = counter;
        entry.values.push(DottedValue { counter, value });
        self
    }

    /// Least upper bound of two clocks.
    ///
    /// Counters take the pointwise max. A dotted value survives iff its
    /// counter exceeds the other side's max for that vnode (the other
    /// side never saw it) or the same dot is present on both sides.
    /// Values covered by the other side's max but missing there were
    /// causally overwritten and are dropped.
    pub fn sync(&self, other: &Dvv) -> Dvv {
        let mut entries = BTreeMap::new();
        let ids: std::collections::BTreeSet<&VnodeId> =
            self.entries.keys().chain(other.entries.keys()).collect();

        for id in ids {
            let a = self.entries.get(id);
            let b = other.entries.get(id);
            let a_max = a.map(|e| e.max).unwrap_or(0);
            let b_max = b.map(|e| e.max).unwrap_or(0);

            let mut merged: BTreeMap<u64, Value> = BTreeMap::new();
            if let Some(a) = a {
                for dv in &a.values {
                    let in_both = b
                        .map(|b| b.values.iter().any(|o| o.counter == dv.counter))
                        .unwrap_or(false);
                    if dv.counter > b_max || in_both {
                        merged.insert(dv.counter, dv.value.clone());
                    }
                }
            }
            if let Some(b) = b {
                for dv in &b.values {
                    let in_both = a
                        .map(|a| a.values.iter().any(|o| o.counter == dv.counter))
                        .unwrap_or(false);
                    if dv.counter > a_max || in_both {
                        merged.entry(dv.counter).or_insert_with(|| dv.value.clone());
                    }
                }
            }

            entries.insert(
                *id,
                Entry {
                    max: a_max.max(b_max),
                    values: merged
                        .into_iter()
                        .map(|(counter, value)| DottedValue { counter, value })
                        .collect(),
                },
            );
        }

        let mut anonymous: Vec<Value> = self
            .anonymous
            .iter()
            .chain(other.anonymous.iter())
            .cloned()
            .collect();
        anonymous.sort();
        anonymous.dedup();

        Dvv { entries, anonymous }
    }

    /// True iff `self` is causally behind `other`: every surviving dot in
    /// `self` is covered by `other`'s history and `other` has seen a dot
    /// `self` has not. Used by read-repair to pick stale replicas.
    pub fn less(&self, other: &Dvv) -> bool {
        let covered = self.entries.iter().all(|(id, e)| {
            let other_max = other.max_counter(id);
            e.values.iter().all(|dv| dv.counter <= other_max)
        });
        let behind = other
            .entries
            .iter()
            .any(|(id, e)| e.max > self.max_counter(id));
        covered && behind
    }

    /// Attach a value with no dot. Only sync paths touching imported data
    /// produce these; the write path always dots.
    pub fn push_anonymous(&mut self, value: Value) {
        self.anonymous.push(value);
    }

    pub(crate) fn anonymous_values(&self) -> &[Value] {
        &self.anonymous
    }

    pub(crate) fn entry_counts(&self) -> Vec<(VnodeId, u64, Vec<DottedValue>)> {
        self.entries
            .iter()
            .map(|(id, e)| (*id, e.max, e.values.clone()))
            .collect()
    }

    pub(crate) fn from_parts(
        parts: Vec<(VnodeId, u64, Vec<DottedValue>)>,
        anonymous: Vec<Value>,
    ) -> Dvv {
        Dvv {
            entries: parts
                .into_iter()
                .map(|(id, max, values)| (id, Entry { max, values }))
                .collect(),
            anonymous,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vid(index: u32) -> VnodeId {
        VnodeId::new(index, 1)
    }

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn ctx(entries: &[(u32, u64)]) -> VersionVector {
        entries.iter().map(|&(i, n)| (vid(i), n)).collect()
    }

    #[test]
    fn test_update_on_empty_clock() {
        let c = Dvv::new().update(&VersionVector::new(), data("v"), vid(1));
        assert_eq!(c.values(), vec![b"v".as_slice()]);
        assert_eq!(c.max_counter(&vid(1)), 1);
        assert_eq!(c.join().get(&vid(1)), 1);
    }

    #[test]
    fn test_update_with_own_context_supersedes() {
        let c = Dvv::new().update(&VersionVector::new(), data("v1"), vid(1));
        let c = c.clone().update(&c.join(), data("v2"), vid(1));
        assert_eq!(c.values(), vec![b"v2".as_slice()]);
        assert_eq!(c.max_counter(&vid(1)), 2);
    }

    #[test]
    fn test_update_empty_context_keeps_siblings() {
        let c = Dvv::new().update(&VersionVector::new(), data("v1"), vid(1));
        let c = c.update(&VersionVector::new(), data("v2"), vid(1));
        let mut values = c.values();
        values.sort();
        assert_eq!(values, vec![b"v1".as_slice(), b"v2".as_slice()]);
    }

    #[test]
    fn test_update_dominates_context() {
        // Client echoes a context from a replica this clock never saw.
        let foreign = ctx(&[(9, 4)]);
        let c = Dvv::new().update(&foreign, data("v"), vid(1));
        assert!(foreign.strictly_dominated_by(&c.join()));
        assert_eq!(c.max_counter(&vid(9)), 4);
    }

    #[test]
    fn test_sync_idempotent() {
        let c = Dvv::new()
            .update(&VersionVector::new(), data("a"), vid(1))
            .update(&VersionVector::new(), data("b"), vid(2));
        assert_eq!(c.sync(&c), c);
    }

    #[test]
    fn test_sync_commutative() {
        let a = Dvv::new().update(&VersionVector::new(), data("a"), vid(1));
        let b = Dvv::new().update(&VersionVector::new(), data("b"), vid(2));
        assert_eq!(a.sync(&b), b.sync(&a));
    }

    #[test]
    fn test_sync_associative() {
        let a = Dvv::new().update(&VersionVector::new(), data("a"), vid(1));
        let b = Dvv::new().update(&VersionVector::new(), data("b"), vid(2));
        let c = a.clone().update(&a.join(), data("c"), vid(3));
        assert_eq!(a.sync(&b).sync(&c), a.sync(&b.sync(&c)));
    }

    #[test]
    fn test_sync_drops_dominated_value() {
        let old = Dvv::new().update(&VersionVector::new(), data("old"), vid(1));
        let new = old.clone().update(&old.join(), data("new"), vid(1));
        // A replica still holding `old` merged with one holding `new`.
        let merged = old.sync(&new);
        assert_eq!(merged.values(), vec![b"new".as_slice()]);
        assert_eq!(merged, new);
    }

    #[test]
    fn test_sync_keeps_concurrent_siblings() {
        // Two writes with the same (empty) context at different vnodes.
        let u1 = Dvv::new().update(&VersionVector::new(), data("v1"), vid(1));
        let u2 = Dvv::new().update(&VersionVector::new(), data("v2"), vid(2));
        let merged = u1.sync(&u2);
        let mut values = merged.values();
        values.sort();
        assert_eq!(values, vec![b"v1".as_slice(), b"v2".as_slice()]);
    }

    #[test]
    fn test_sync_values_subset_of_union() {
        let a = Dvv::new()
            .update(&VersionVector::new(), data("x"), vid(1))
            .update(&VersionVector::new(), data("y"), vid(2));
        let b = a.clone().update(&a.join(), data("z"), vid(1));
        let merged = a.sync(&b);
        let union: Vec<&[u8]> = a.values().into_iter().chain(b.values()).collect();
        for v in merged.values() {
            assert!(union.contains(&v));
        }
    }

    #[test]
    fn test_sync_one_sided_vnode() {
        // A vnode id appearing on only one side is treated as max 0 on
        // the other, so its values survive.
        let a = Dvv::new().update(&VersionVector::new(), data("only-a"), vid(7));
        let merged = a.sync(&Dvv::new());
        assert_eq!(merged.values(), vec![b"only-a".as_slice()]);
        assert_eq!(merged.max_counter(&vid(7)), 1);
    }

    #[test]
    fn test_less_on_stale_replica() {
        let a = Dvv::new().update(&VersionVector::new(), data("v1"), vid(1));
        let b = a.clone().update(&a.join(), data("v2"), vid(1));
        assert!(a.less(&b));
        assert!(!b.less(&a));
        assert!(!a.less(&a));
    }

    #[test]
    fn test_less_concurrent_is_false_both_ways() {
        let a = Dvv::new().update(&VersionVector::new(), data("v1"), vid(1));
        let b = Dvv::new().update(&VersionVector::new(), data("v2"), vid(2));
        assert!(!a.less(&b));
        assert!(!b.less(&a));
    }

    #[test]
    fn test_less_implies_sync_equals_greater() {
        let a = Dvv::new().update(&VersionVector::new(), data("v1"), vid(1));
        let b = a.clone().update(&a.join(), data("v2"), vid(2));
        assert!(a.less(&b));
        assert_eq!(a.sync(&b), b);
    }

    #[test]
    fn test_empty_clock_less_than_written() {
        let empty = Dvv::new();
        let written = Dvv::new().update(&VersionVector::new(), data("v"), vid(1));
        assert!(empty.less(&written));
        assert!(!written.less(&empty));
    }

    #[test]
    fn test_tombstone_suppressed_in_values() {
        let c = Dvv::new().update(&VersionVector::new(), data("v"), vid(1));
        let c = c.clone().update(&c.join(), Value::Tombstone, vid(1));
        assert!(c.values().is_empty());
        assert!(!c.is_empty(), "tombstoned object still has causal history");
        assert!(!c.join().is_empty());
    }

    #[test]
    fn test_tombstone_concurrent_with_write_survives_merge() {
        let base = Dvv::new().update(&VersionVector::new(), data("v"), vid(1));
        let deleted = base.clone().update(&base.join(), Value::Tombstone, vid(1));
        let rewritten = base.clone().update(&base.join(), data("v2"), vid(2));
        let merged = deleted.sync(&rewritten);
        // The concurrent write survives next to the (hidden) tombstone.
        assert_eq!(merged.values(), vec![b"v2".as_slice()]);
        assert_eq!(merged.dotted_len(), 2);
    }

    #[test]
    fn test_anonymous_values_dedup_on_sync() {
        let mut a = Dvv::new();
        a.push_anonymous(data("legacy"));
        let mut b = Dvv::new();
        b.push_anonymous(data("legacy"));
        b.push_anonymous(data("other"));
        let merged = a.sync(&b);
        let mut values = merged.values();
        values.sort();
        assert_eq!(values, vec![b"legacy".as_slice(), b"other".as_slice()]);
    }

    #[test]
    fn test_version_vector_strict_domination() {
        let small = ctx(&[(1, 1)]);
        let big = ctx(&[(1, 2), (2, 1)]);
        assert!(small.strictly_dominated_by(&big));
        assert!(!big.strictly_dominated_by(&small));
        assert!(!small.strictly_dominated_by(&small));
    }

    #[test]
    fn test_epoch_distinguishes_vnode_ids() {
        // Same partition, different epoch: dots must not collide.
        let before = VnodeId::new(1, 1);
        let after = VnodeId::new(1, 2);
        let a = Dvv::new().update(&VersionVector::new(), data("pre"), before);
        let b = Dvv::new().update(&VersionVector::new(), data("post"), after);
        let merged = a.sync(&b);
        let mut values = merged.values();
        values.sort();
        assert_eq!(values, vec![b"post".as_slice(), b"pre".as_slice()]);
    }
}
