//! Last-writer-wins replicated map of peer states
//!
//! Every key-level write carries a [`Stamp`] `(counter, replica)`. Merging two
//! replicas keeps, per key, the entry with the greater stamp; stamps order by
//! counter first and replica id second. Deletes are tombstones with their own
//! stamp, so a delete and a concurrent update resolve like any other pair of
//! writes and stale data is never resurrected.
//!
//! Local counters are hybrid: `max(last + 1, now_ms)`, and every merge raises
//! `last` to the highest counter observed. A local write therefore dominates
//! anything the replica has already seen, and heartbeat timestamps (Unix
//! millis) are directly comparable to delta-derived stamps.
//!
//! Foreign stamps more than [`MAX_CLOCK_DRIFT_MS`] ahead of the local clock
//! are refused, and tombstones older than [`TOMBSTONE_TTL_MS`] are dropped so
//! the full-state delta stays bounded.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::{now_millis, PeerId, PeerStatePatch, PeerStateRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Snapshot encoding version carried inside every delta
const SNAPSHOT_FORMAT: u8 = 1;

/// How far a foreign stamp may run ahead of the local clock
pub const MAX_CLOCK_DRIFT_MS: u64 = 5 * 60 * 1000;

/// Age after which a tombstone is forgotten
pub const TOMBSTONE_TTL_MS: u64 = 10 * 60 * 1000;

/// Causal stamp attached to each write. Ordered by counter, then replica.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica: PeerId,
}

impl Stamp {
    pub fn new(counter: u64, replica: impl Into<PeerId>) -> Self {
        Self {
            counter,
            replica: replica.into(),
        }
    }
}

/// Stamped value; `None` is a tombstone
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Entry {
    stamp: Stamp,
    value: Option<PeerStateRecord>,
}

impl Entry {
    /// Total order used by merge. Equal stamps fall back to the canonical
    /// bytes of the value so every replica picks the same winner.
    fn cmp_for_merge(&self, other: &Entry) -> Ordering {
        self.stamp.cmp(&other.stamp).then_with(|| {
            let ours = canonical_bytes(&self.value).unwrap_or_default();
            let theirs = canonical_bytes(&other.value).unwrap_or_default();
            ours.cmp(&theirs)
        })
    }

    fn dominates(&self, other: &Entry) -> bool {
        self.cmp_for_merge(other) == Ordering::Greater
    }
}

/// Full-state delta
#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u8,
    entries: Vec<(PeerId, Entry)>,
}

/// Replicated peer-state map owned by a single replica
pub struct ReplicatedStore {
    replica: PeerId,
    /// Highest counter written or observed
    counter: u64,
    entries: BTreeMap<PeerId, Entry>,
    time_source: fn() -> u64,
}

impl ReplicatedStore {
    /// Create an empty store for the given local replica id
    pub fn new(replica: PeerId) -> Self {
        Self::with_time_source(replica, now_millis)
    }

    /// Create a store with a custom wall clock. A clock that always returns 0
    /// turns the hybrid counter into a plain Lamport counter.
    pub fn with_time_source(replica: PeerId, time_source: fn() -> u64) -> Self {
        Self {
            replica,
            counter: 0,
            entries: BTreeMap::new(),
            time_source,
        }
    }

    /// The local replica id (this node's peer id)
    pub fn local_id(&self) -> &PeerId {
        &self.replica
    }

    fn now(&self) -> u64 {
        (self.time_source)()
    }

    fn next_stamp(&mut self) -> Stamp {
        self.counter = self.counter.saturating_add(1).max(self.now());
        Stamp::new(self.counter, self.replica.clone())
    }

    fn observe(&mut self, stamp: &Stamp) {
        self.counter = self.counter.max(stamp.counter);
    }

    fn too_far_ahead(&self, stamp: &Stamp) -> bool {
        stamp.counter > self.now().saturating_add(MAX_CLOCK_DRIFT_MS)
    }

    fn expired(&self, entry: &Entry) -> bool {
        entry.value.is_none() && self.now().saturating_sub(entry.stamp.counter) > TOMBSTONE_TTL_MS
    }

    fn live(&self, id: &PeerId) -> Option<&PeerStateRecord> {
        self.entries.get(id).and_then(|e| e.value.as_ref())
    }

    /// Merge `patch` onto the current record for `id` under a fresh local stamp.
    pub fn set_local(&mut self, id: &PeerId, patch: &PeerStatePatch) -> PeerStateRecord {
        let stamp = self.next_stamp();
        let record = patch.apply(id, self.live(id), now_millis());
        self.entries.insert(
            id.clone(),
            Entry {
                stamp,
                value: Some(record.clone()),
            },
        );
        record
    }

    /// Merge `patch` onto the current record for `id` under a foreign stamp.
    ///
    /// Returns `false` without touching state if the current entry (live or
    /// tombstone) already carries a stamp at least as recent, or if `stamp`
    /// is too far ahead of the local clock.
    pub fn set_remote(&mut self, id: &PeerId, patch: &PeerStatePatch, stamp: Stamp) -> bool {
        if self.too_far_ahead(&stamp) {
            return false;
        }
        if let Some(current) = self.entries.get(id) {
            if current.stamp >= stamp {
                return false;
            }
        }
        self.observe(&stamp);
        let record = patch.apply(id, self.live(id), now_millis());
        self.entries.insert(
            id.clone(),
            Entry {
                stamp,
                value: Some(record),
            },
        );
        true
    }

    /// Tombstone the record for `id`. Returns `false` if there is no live record.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        if self.live(id).is_none() {
            return false;
        }
        let stamp = self.next_stamp();
        self.entries.insert(id.clone(), Entry { stamp, value: None });
        true
    }

    /// Serialize the full replicated state, unexpired tombstones included.
    pub fn get_delta(&self) -> Vec<u8> {
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            entries: self
                .entries
                .iter()
                .filter(|(_, entry)| !self.expired(entry))
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect(),
        };
        // Records contain only strings, numbers and vectors; postcard cannot fail on them.
        canonical_bytes(&snapshot).unwrap_or_default()
    }

    /// Merge a delta produced by [`get_delta`](Self::get_delta).
    ///
    /// The delta is decoded and validated in full before any entry is merged,
    /// so an invalid delta leaves the store untouched. Returns the number of
    /// keys whose entry changed.
    pub fn apply_delta(&mut self, bytes: &[u8]) -> Result<usize> {
        let snapshot: Snapshot =
            postcard::from_bytes(bytes).map_err(|e| Error::InvalidDelta(e.to_string()))?;

        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(Error::InvalidDelta(format!(
                "unknown snapshot format: {}",
                snapshot.format
            )));
        }
        for (id, entry) in &snapshot.entries {
            if id.is_empty() || entry.stamp.replica.is_empty() {
                return Err(Error::InvalidDelta("empty identifier".into()));
            }
            if let Some(record) = &entry.value {
                if &record.id != id {
                    return Err(Error::InvalidDelta(format!(
                        "record id {} stored under key {}",
                        record.id, id
                    )));
                }
            }
            if self.too_far_ahead(&entry.stamp) {
                return Err(Error::InvalidDelta(format!(
                    "stamp {} for {} is ahead of the local clock",
                    entry.stamp.counter, id
                )));
            }
        }

        let mut changed = 0;
        for (id, incoming) in snapshot.entries {
            if self.merge_entry(id, incoming) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn merge_entry(&mut self, id: PeerId, incoming: Entry) -> bool {
        self.observe(&incoming.stamp);
        let expired = self.expired(&incoming);
        match self.entries.get(&id) {
            Some(current) if !incoming.dominates(current) => false,
            // An old delete still wins over older data but is not kept
            Some(_) if expired => {
                self.entries.remove(&id);
                true
            }
            None if expired => false,
            _ => {
                self.entries.insert(id, incoming);
                true
            }
        }
    }

    /// Forget tombstones older than [`TOMBSTONE_TTL_MS`]. Returns how many
    /// were dropped.
    pub fn prune_tombstones(&mut self) -> usize {
        let now = self.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.value.is_some() || now.saturating_sub(entry.stamp.counter) <= TOMBSTONE_TTL_MS
        });
        before - self.entries.len()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerStateRecord> {
        self.live(id)
    }

    /// All live records, ordered by peer id
    pub fn get_all(&self) -> Vec<PeerStateRecord> {
        self.entries
            .values()
            .filter_map(|e| e.value.clone())
            .collect()
    }

    /// Number of live records
    pub fn count(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_some()).count()
    }

    /// Stamp of the current entry for `id`, tombstones included
    pub fn stamp_of(&self, id: &PeerId) -> Option<&Stamp> {
        self.entries.get(id).map(|e| &e.stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mood, Position};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    fn lamport() -> u64 {
        0
    }

    fn store(replica: &str) -> ReplicatedStore {
        ReplicatedStore::with_time_source(PeerId::new(replica), lamport)
    }

    fn observer() -> ReplicatedStore {
        store("observer")
    }

    #[test]
    fn test_set_local_visible_immediately() {
        let mut s = store("me");
        let id = PeerId::new("me");
        s.set_local(&id, &PeerStatePatch::new().name("Ada"));

        assert_eq!(s.get(&id).unwrap().name, "Ada");
        assert_eq!(s.count(), 1);
        assert_eq!(s.stamp_of(&id), Some(&Stamp::new(1, "me")));

        s.set_local(&id, &PeerStatePatch::new().mood(Mood::Busy));
        let record = s.get(&id).unwrap();
        assert_eq!(record.name, "Ada");
        assert_eq!(record.mood, Mood::Busy);
        assert_eq!(s.stamp_of(&id), Some(&Stamp::new(2, "me")));
    }

    #[test]
    fn test_hybrid_counter_follows_wall_clock() {
        fn fixed() -> u64 {
            1_000
        }
        let mut s = ReplicatedStore::with_time_source(PeerId::new("me"), fixed);
        let id = PeerId::new("me");
        s.set_local(&id, &PeerStatePatch::new());
        assert_eq!(s.stamp_of(&id).unwrap().counter, 1_000);
        s.set_local(&id, &PeerStatePatch::new());
        assert_eq!(s.stamp_of(&id).unwrap().counter, 1_001);
    }

    #[test]
    fn test_tie_break_prefers_greater_replica() {
        let key = PeerId::new("shared");

        let mut alpha = store("alpha");
        alpha.set_local(&key, &PeerStatePatch::new().name("from-alpha"));
        let mut beta = store("beta");
        beta.set_local(&key, &PeerStatePatch::new().name("from-beta"));
        assert_eq!(alpha.stamp_of(&key).unwrap().counter, 1);
        assert_eq!(beta.stamp_of(&key).unwrap().counter, 1);

        let d_alpha = alpha.get_delta();
        let d_beta = beta.get_delta();

        let mut first = observer();
        first.apply_delta(&d_alpha).unwrap();
        first.apply_delta(&d_beta).unwrap();

        let mut second = observer();
        second.apply_delta(&d_beta).unwrap();
        second.apply_delta(&d_alpha).unwrap();

        assert_eq!(first.get(&key).unwrap().name, "from-beta");
        assert_eq!(second.get(&key).unwrap().name, "from-beta");
        assert_eq!(first.get_delta(), second.get_delta());
    }

    #[test]
    fn test_set_remote_respects_stamps() {
        let mut s = store("me");
        let id = PeerId::new("abc123");

        assert!(s.set_remote(&id, &PeerStatePatch::new().mood(Mood::Busy), Stamp::new(10, "abc123")));
        // Older stamp is ignored
        assert!(!s.set_remote(&id, &PeerStatePatch::new().mood(Mood::Idle), Stamp::new(9, "abc123")));
        // Same stamp is not re-applied
        assert!(!s.set_remote(&id, &PeerStatePatch::new().mood(Mood::Idle), Stamp::new(10, "abc123")));
        assert_eq!(s.get(&id).unwrap().mood, Mood::Busy);

        assert!(s.set_remote(&id, &PeerStatePatch::new().position(Position::new(1.0, 2.0)), Stamp::new(11, "abc123")));
        let record = s.get(&id).unwrap();
        assert_eq!(record.mood, Mood::Busy);
        assert_eq!(record.position, Position::new(1.0, 2.0));

        // The next local write must dominate everything observed so far
        s.set_local(&id, &PeerStatePatch::new().name("renamed"));
        assert_eq!(s.stamp_of(&id).unwrap().counter, 12);
    }

    #[test]
    fn test_tombstone_dominates_older_update() {
        let id = PeerId::new("gone");

        let mut a = store("a");
        a.set_local(&id, &PeerStatePatch::new().name("v1"));
        let before_delete = a.get_delta();
        assert!(a.remove(&id));
        assert!(a.get(&id).is_none());
        assert!(!a.remove(&id));

        // Replaying the older state does not resurrect the record
        a.apply_delta(&before_delete).unwrap();
        assert!(a.get(&id).is_none());

        let mut b = observer();
        b.apply_delta(&before_delete).unwrap();
        assert_eq!(b.count(), 1);
        b.apply_delta(&a.get_delta()).unwrap();
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn test_update_after_delete_wins() {
        let id = PeerId::new("returning");
        let mut a = store("a");
        a.set_local(&id, &PeerStatePatch::new().name("first"));
        a.remove(&id);

        let mut b = store("b");
        b.apply_delta(&a.get_delta()).unwrap();
        b.set_local(&id, &PeerStatePatch::new().name("back"));

        a.apply_delta(&b.get_delta()).unwrap();
        assert_eq!(a.get(&id).unwrap().name, "back");
    }

    #[test]
    fn test_remove_leaves_other_records() {
        let mut s = store("me");
        let a = PeerId::new("peer-a");
        let b = PeerId::new("peer-b");
        s.set_remote(&a, &PeerStatePatch::new().name("A"), Stamp::new(5, "peer-a"));
        s.set_remote(&b, &PeerStatePatch::new().name("B"), Stamp::new(5, "peer-b"));
        let b_before = s.get(&b).cloned();

        assert!(s.remove(&a));
        assert_eq!(s.count(), 1);
        assert_eq!(s.get(&b).cloned(), b_before);
        assert_eq!(s.get_all(), vec![b_before.unwrap()]);
    }

    #[test]
    fn test_invalid_delta_does_not_mutate() {
        let mut s = store("me");
        let id = PeerId::new("me");
        s.set_local(&id, &PeerStatePatch::new().name("stable"));
        let before = s.get_delta();

        assert!(matches!(s.apply_delta(&[]), Err(Error::InvalidDelta(_))));
        assert!(matches!(s.apply_delta(&[0xff, 0xff, 0xff]), Err(Error::InvalidDelta(_))));

        let mut truncated = before.clone();
        truncated.pop();
        assert!(s.apply_delta(&truncated).is_err());
        assert_eq!(s.get_delta(), before);
    }

    #[test]
    fn test_delta_with_mismatched_id_rejected_whole() {
        let good = PeerId::new("good");
        let bad = PeerId::new("bad");
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            entries: vec![
                (
                    good.clone(),
                    Entry {
                        stamp: Stamp::new(1, "x"),
                        value: Some(PeerStateRecord::with_defaults(good.clone())),
                    },
                ),
                (
                    bad,
                    Entry {
                        stamp: Stamp::new(1, "x"),
                        value: Some(PeerStateRecord::with_defaults(PeerId::new("other"))),
                    },
                ),
            ],
        };
        let bytes = postcard::to_allocvec(&snapshot).unwrap();

        let mut s = observer();
        assert!(matches!(s.apply_delta(&bytes), Err(Error::InvalidDelta(_))));
        assert_eq!(s.count(), 0);
        assert!(s.get(&good).is_none());
    }

    #[test]
    fn test_catch_up_reproduces_state() {
        let mut a = ReplicatedStore::new(PeerId::new("aaaa"));
        let me = a.local_id().clone();
        a.set_local(&me, &PeerStatePatch::new().name("A").position(Position::new(4.0, 2.0)));

        let mut b = ReplicatedStore::new(PeerId::new("bbbb"));
        b.apply_delta(&a.get_delta()).unwrap();
        assert_eq!(b.get(&me), a.get(&me));
    }

    #[test]
    fn test_far_future_stamps_refused() {
        let mut s = store("me");
        let me = PeerId::new("me");
        let peer = PeerId::new("peer");

        assert!(!s.set_remote(&peer, &PeerStatePatch::new(), Stamp::new(u64::MAX, "peer")));
        assert!(s.get(&peer).is_none());

        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            entries: vec![
                (
                    me.clone(),
                    Entry {
                        stamp: Stamp::new(3, "x"),
                        value: Some(PeerStateRecord::with_defaults(me.clone())),
                    },
                ),
                (
                    peer.clone(),
                    Entry {
                        stamp: Stamp::new(u64::MAX, "x"),
                        value: None,
                    },
                ),
            ],
        };
        let bytes = postcard::to_allocvec(&snapshot).unwrap();
        assert!(matches!(s.apply_delta(&bytes), Err(Error::InvalidDelta(_))));
        assert_eq!(s.count(), 0);

        s.set_local(&me, &PeerStatePatch::new().name("still-here"));
        assert_eq!(s.stamp_of(&me), Some(&Stamp::new(1, "me")));

        // Right at the drift bound is still accepted
        assert!(s.set_remote(&peer, &PeerStatePatch::new(), Stamp::new(MAX_CLOCK_DRIFT_MS, "peer")));
        s.set_local(&me, &PeerStatePatch::new());
        assert_eq!(s.stamp_of(&me).unwrap().counter, MAX_CLOCK_DRIFT_MS + 1);
    }

    #[test]
    fn test_counter_saturates() {
        let mut s = store("me");
        let me = PeerId::new("me");
        s.counter = u64::MAX;
        s.set_local(&me, &PeerStatePatch::new());
        s.set_local(&me, &PeerStatePatch::new());
        assert_eq!(s.stamp_of(&me).unwrap().counter, u64::MAX);
    }

    static CLOCK: AtomicU64 = AtomicU64::new(0);

    fn test_clock() -> u64 {
        CLOCK.load(AtomicOrdering::SeqCst)
    }

    #[test]
    fn test_old_tombstones_are_forgotten() {
        CLOCK.store(1_000_000, AtomicOrdering::SeqCst);
        let gone = PeerId::new("gone");

        let mut a = ReplicatedStore::with_time_source(PeerId::new("a"), test_clock);
        a.set_local(&gone, &PeerStatePatch::new().name("old"));
        let before_delete = a.get_delta();
        assert!(a.remove(&gone));
        let tombstone = a.get_delta();
        assert_eq!(a.stamp_of(&gone).unwrap().counter, 1_000_001);

        CLOCK.store(1_000_002 + TOMBSTONE_TTL_MS, AtomicOrdering::SeqCst);
        let empty = ReplicatedStore::with_time_source(PeerId::new("x"), test_clock).get_delta();
        assert_eq!(a.get_delta(), empty);

        // The expired delete still removes older data, then leaves nothing behind
        let mut b = ReplicatedStore::with_time_source(PeerId::new("b"), test_clock);
        b.apply_delta(&before_delete).unwrap();
        assert_eq!(b.count(), 1);
        assert_eq!(b.apply_delta(&tombstone).unwrap(), 1);
        assert_eq!(b.count(), 0);
        assert!(b.stamp_of(&gone).is_none());

        assert_eq!(a.prune_tombstones(), 1);
        assert!(a.stamp_of(&gone).is_none());
        assert_eq!(a.prune_tombstones(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Set { key: u8, name: u8 },
        Remove { key: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, any::<u8>()).prop_map(|(key, name)| Op::Set { key, name }),
            (0u8..4).prop_map(|key| Op::Remove { key }),
        ]
    }

    /// Three replicas run independent op sequences, occasionally syncing
    /// with their left neighbour.
    fn replica_deltas(ops: &[(u8, Op, bool)]) -> Vec<Vec<u8>> {
        let mut replicas = vec![store("r0"), store("r1"), store("r2")];
        for (who, op, sync) in ops {
            let idx = (*who % 3) as usize;
            if *sync {
                let left = replicas[(idx + 2) % 3].get_delta();
                replicas[idx].apply_delta(&left).unwrap();
            }
            let r = &mut replicas[idx];
            match op {
                Op::Set { key, name } => {
                    let id = PeerId::new(format!("k{key}"));
                    r.set_local(&id, &PeerStatePatch::new().name(format!("n{name}")));
                }
                Op::Remove { key } => {
                    r.remove(&PeerId::new(format!("k{key}")));
                }
            }
        }
        replicas.iter().map(|r| r.get_delta()).collect()
    }

    fn merged(deltas: &[&Vec<u8>]) -> Vec<u8> {
        let mut s = observer();
        for d in deltas {
            s.apply_delta(d).unwrap();
        }
        s.get_delta()
    }

    proptest! {
        #[test]
        fn prop_merge_commutative(ops in prop::collection::vec((any::<u8>(), op_strategy(), any::<bool>()), 0..40)) {
            let d = replica_deltas(&ops);
            prop_assert_eq!(merged(&[&d[0], &d[1]]), merged(&[&d[1], &d[0]]));
            prop_assert_eq!(
                merged(&[&d[0], &d[1], &d[2]]),
                merged(&[&d[2], &d[0], &d[1]])
            );
        }

        #[test]
        fn prop_merge_idempotent(ops in prop::collection::vec((any::<u8>(), op_strategy(), any::<bool>()), 0..40)) {
            let d = replica_deltas(&ops);
            prop_assert_eq!(merged(&[&d[0]]), merged(&[&d[0], &d[0]]));
            let full = merged(&[&d[0], &d[1], &d[2]]);
            prop_assert_eq!(merged(&[&full, &d[1]]), full.clone());
        }

        #[test]
        fn prop_merge_associative(ops in prop::collection::vec((any::<u8>(), op_strategy(), any::<bool>()), 0..40)) {
            let d = replica_deltas(&ops);
            let right = merged(&[&d[1], &d[2]]);
            let left = merged(&[&d[0], &d[1]]);
            prop_assert_eq!(merged(&[&d[0], &right]), merged(&[&left, &d[2]]));
        }
    }
}
