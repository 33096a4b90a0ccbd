//! Generic timestamp-gated entity cache.
//!
//! Every domain cache (tasks, health, community) is a [`DomainCache`] over an
//! entity type implementing [`CacheEntry`]. Push events, REST responses and
//! optimistic local mutations all go through the same merge rule:
//!
//! - a mutation is applied only if its timestamp is newer than the entry's
//!   `last_applied`; older or equal timestamps are discarded;
//! - deletes are unconditional and leave a tombstone at the highest known
//!   timestamp, so a stale in-flight create or update cannot resurrect the
//!   entity;
//! - an optimistic local mutation is stamped `last_applied + 1` and marked
//!   provisional. Optimistic mutations stack on top of the last confirmed
//!   server state. A server mutation newer than that state is applied to it
//!   and the still-pending local mutations are replayed on top; rolling one
//!   back replays the others without it.
//!
//! Tombstones are kept until a full hydration at a version at or past them
//! ([`DomainCache::advance_floor`]) or until [`DomainCache::clear`].
//!
//! Reads (`get`, `list`, `len`) are pure projections.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::types::Timestamp;

/// Default broadcast channel capacity for cache change notifications.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// An entity that can live in a [`DomainCache`].
pub trait CacheEntry: Clone + Send + Sync + 'static {
    /// Partial update applied by [`DomainCache::apply_update`].
    type Patch: Send + Sync;

    /// Entity kind, used in logs.
    const KIND: &'static str;

    /// Stable identifier, unique within the cache.
    fn id(&self) -> &str;

    /// Apply a partial update in place.
    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Build a new entity from a patch when the id is not cached yet.
    ///
    /// Returns `None` when the patch lacks fields the entity requires, in
    /// which case the update is reported as [`MergeOutcome::Missing`].
    fn from_patch(_id: &str, _patch: &Self::Patch) -> Option<Self> {
        None
    }
}

/// A cached entity with its ordering metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry<T> {
    pub value: T,
    /// Timestamp of the last mutation applied to this entry.
    pub last_applied: Timestamp,
    /// Whether the current value is an unconfirmed optimistic mutation.
    pub provisional: bool,
}

impl<T> CachedEntry<T> {
    fn new(value: T, last_applied: Timestamp) -> Self {
        Self {
            value,
            last_applied,
            provisional: false,
        }
    }
}

type Transform<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

struct PendingMutation<T> {
    applied_at: Timestamp,
    transform: Transform<T>,
}

/// Last confirmed server state and the local mutations stacked on it, oldest
/// first. Never holds an empty stack.
struct Pending<T> {
    base: CachedEntry<T>,
    mutations: Vec<PendingMutation<T>>,
}

struct Live<T> {
    entry: CachedEntry<T>,
    pending: Option<Pending<T>>,
}

impl<T: CacheEntry> Live<T> {
    fn new(value: T, ts: Timestamp) -> Self {
        Self {
            entry: CachedEntry::new(value, ts),
            pending: None,
        }
    }

    /// Timestamp of the last state the server confirmed.
    fn confirmed_at(&self) -> Timestamp {
        self.pending
            .as_ref()
            .map_or(self.entry.last_applied, |p| p.base.last_applied)
    }

    fn accepts(&self, ts: Timestamp) -> bool {
        ts > self.confirmed_at()
    }

    /// Apply a server mutation at `ts` to the confirmed state. Local
    /// mutations stamped after `ts` are replayed on top; the rest are
    /// considered confirmed.
    fn apply_server<F>(&mut self, ts: Timestamp, mutate: F)
    where
        F: FnOnce(&mut T),
    {
        match self.pending.take() {
            None => {
                mutate(&mut self.entry.value);
                self.entry.last_applied = ts;
                self.entry.provisional = false;
            }
            Some(mut pending) => {
                mutate(&mut pending.base.value);
                pending.base.last_applied = ts;
                pending.mutations.retain(|m| m.applied_at > ts);
                self.rebuild(pending);
            }
        }
    }

    fn push_optimistic(&mut self, transform: Transform<T>) -> Timestamp {
        let applied_at = self.entry.last_applied.next();
        let mut pending = self.pending.take().unwrap_or_else(|| Pending {
            base: self.entry.clone(),
            mutations: Vec::new(),
        });
        pending.mutations.push(PendingMutation {
            applied_at,
            transform,
        });
        self.rebuild(pending);
        applied_at
    }

    /// Drop the local mutation stamped `applied_at`. Returns false when it
    /// is no longer pending.
    fn revert(&mut self, applied_at: Timestamp) -> bool {
        let Some(mut pending) = self.pending.take() else {
            return false;
        };
        let before = pending.mutations.len();
        pending.mutations.retain(|m| m.applied_at != applied_at);
        let reverted = pending.mutations.len() != before;
        self.rebuild(pending);
        reverted
    }

    fn rebuild(&mut self, pending: Pending<T>) {
        if pending.mutations.is_empty() {
            self.entry = pending.base;
            self.pending = None;
            return;
        }
        let mut entry = pending.base.clone();
        for m in &pending.mutations {
            (m.transform)(&mut entry.value);
            entry.last_applied = m.applied_at;
        }
        entry.provisional = true;
        self.entry = entry;
        self.pending = Some(pending);
    }
}

enum Slot<T> {
    Live(Live<T>),
    Tombstone(Timestamp),
}

/// Result of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new entry was inserted.
    Created,
    /// An existing entry was mutated.
    Applied,
    /// The mutation was older than (or as old as) the entry and was discarded.
    Stale,
    /// The entry does not exist and the mutation cannot create it.
    Missing,
    /// The entry was removed.
    Deleted,
    /// Delete of an entry that was not cached.
    Absent,
}

impl MergeOutcome {
    /// Whether the cache contents changed.
    pub fn changed(self) -> bool {
        matches!(
            self,
            MergeOutcome::Created | MergeOutcome::Applied | MergeOutcome::Deleted
        )
    }
}

/// Kind of committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    RolledBack,
    Cleared,
}

/// Notification sent to cache subscribers after every committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    pub id: String,
    pub kind: ChangeKind,
    pub timestamp: Timestamp,
}

/// Handle to undo an optimistic mutation if the server rejects it.
#[derive(Debug)]
#[must_use = "an optimistic mutation must be rolled back if the request fails"]
pub struct OptimisticToken<T> {
    id: String,
    applied_at: Timestamp,
    _entity: PhantomData<fn() -> T>,
}

impl<T> OptimisticToken<T> {
    /// Id of the optimistically mutated entry.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local timestamp the mutation was stamped with.
    pub fn applied_at(&self) -> Timestamp {
        self.applied_at
    }
}

/// In-memory cache of one entity type, keyed by id.
pub struct DomainCache<T: CacheEntry> {
    slots: DashMap<String, Slot<T>>,
    updates_tx: broadcast::Sender<CacheChange>,
    revision: AtomicU64,
    /// Version of the last full hydration. Uncached ids at or below it are
    /// known not to exist.
    floor: AtomicU64,
}

impl<T: CacheEntry> DomainCache<T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// Create an empty cache whose change channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            slots: DashMap::new(),
            updates_tx,
            revision: AtomicU64::new(0),
            floor: AtomicU64::new(0),
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.updates_tx.subscribe()
    }

    /// Monotonic counter bumped on every committed change.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn commit(&self, id: &str, kind: ChangeKind, timestamp: Timestamp) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        let change = CacheChange {
            id: id.to_string(),
            kind,
            timestamp,
        };
        if self.updates_tx.send(change).is_err() {
            trace!(kind = T::KIND, "no subscribers for cache change");
        }
    }

    fn stale(&self, id: &str, ts: Timestamp, current: Timestamp) -> MergeOutcome {
        trace!(kind = T::KIND, id, %ts, %current, "discarding stale mutation");
        MergeOutcome::Stale
    }

    fn floor(&self) -> Timestamp {
        Timestamp(self.floor.load(Ordering::SeqCst))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert an entity, or replace it if `ts` is newer than the cached copy.
    pub fn apply_create(&self, entry: T, ts: Timestamp) -> MergeOutcome {
        let id = entry.id().to_string();
        let outcome = match self.slots.entry(id.clone()) {
            Entry::Vacant(v) => {
                let floor = self.floor();
                if ts <= floor {
                    return self.stale(&id, ts, floor);
                }
                v.insert(Slot::Live(Live::new(entry, ts)));
                MergeOutcome::Created
            }
            Entry::Occupied(mut o) => match o.get_mut() {
                Slot::Live(live) => {
                    if !live.accepts(ts) {
                        return self.stale(&id, ts, live.confirmed_at());
                    }
                    live.apply_server(ts, |value| *value = entry);
                    MergeOutcome::Applied
                }
                Slot::Tombstone(deleted_at) => {
                    if ts <= *deleted_at {
                        return self.stale(&id, ts, *deleted_at);
                    }
                    o.insert(Slot::Live(Live::new(entry, ts)));
                    MergeOutcome::Created
                }
            },
        };

        self.commit(&id, change_kind(outcome), ts);
        outcome
    }

    /// Apply a partial update if `ts` is newer than the cached entry.
    ///
    /// When the id is not cached, the entry is created from the patch if
    /// [`CacheEntry::from_patch`] can build one.
    pub fn apply_update(&self, id: &str, patch: &T::Patch, ts: Timestamp) -> MergeOutcome {
        let outcome = match self.slots.entry(id.to_string()) {
            Entry::Vacant(v) => {
                let floor = self.floor();
                if ts <= floor {
                    return self.stale(id, ts, floor);
                }
                match T::from_patch(id, patch) {
                    Some(value) => {
                        v.insert(Slot::Live(Live::new(value, ts)));
                        MergeOutcome::Created
                    }
                    None => MergeOutcome::Missing,
                }
            }
            Entry::Occupied(mut o) => match o.get_mut() {
                Slot::Live(live) => {
                    if !live.accepts(ts) {
                        return self.stale(id, ts, live.confirmed_at());
                    }
                    live.apply_server(ts, |value| value.apply_patch(patch));
                    MergeOutcome::Applied
                }
                Slot::Tombstone(deleted_at) => {
                    if ts <= *deleted_at {
                        return self.stale(id, ts, *deleted_at);
                    }
                    match T::from_patch(id, patch) {
                        Some(value) => {
                            o.insert(Slot::Live(Live::new(value, ts)));
                            MergeOutcome::Created
                        }
                        None => MergeOutcome::Missing,
                    }
                }
            },
        };

        if outcome == MergeOutcome::Missing {
            debug!(kind = T::KIND, id, %ts, "update for unknown entry cannot create it");
            return outcome;
        }
        self.commit(id, change_kind(outcome), ts);
        outcome
    }

    /// Apply a domain-specific transform (complete, snooze, like, ...) if `ts`
    /// is newer than the cached entry. No-op when the entry is not cached.
    pub fn apply_domain_specific<F>(&self, id: &str, transform: F, ts: Timestamp) -> MergeOutcome
    where
        F: FnOnce(&mut T),
    {
        let outcome = match self.slots.get_mut(id) {
            Some(mut slot) => match &mut *slot {
                Slot::Live(live) => {
                    if !live.accepts(ts) {
                        return self.stale(id, ts, live.confirmed_at());
                    }
                    live.apply_server(ts, transform);
                    MergeOutcome::Applied
                }
                Slot::Tombstone(_) => MergeOutcome::Missing,
            },
            None => MergeOutcome::Missing,
        };

        if outcome == MergeOutcome::Missing {
            trace!(kind = T::KIND, id, %ts, "transform for unknown entry ignored");
            return outcome;
        }
        self.commit(id, ChangeKind::Updated, ts);
        outcome
    }

    /// Remove an entry unconditionally.
    pub fn apply_delete(&self, id: &str) -> MergeOutcome {
        self.delete_with(id, None)
    }

    /// Remove an entry unconditionally, recording that the server deleted it
    /// at `ts`. Creates or updates at or before `ts` are rejected afterwards,
    /// even when they arrive after the delete.
    pub fn apply_delete_at(&self, id: &str, ts: Timestamp) -> MergeOutcome {
        self.delete_with(id, Some(ts))
    }

    fn delete_with(&self, id: &str, ts: Option<Timestamp>) -> MergeOutcome {
        let (outcome, tombstone) = match self.slots.entry(id.to_string()) {
            Entry::Occupied(mut o) => {
                let (was_live, known) = match o.get() {
                    Slot::Live(live) => (true, live.confirmed_at()),
                    Slot::Tombstone(deleted_at) => (false, *deleted_at),
                };
                let tombstone = ts.map_or(known, |ts| ts.max(known));
                o.insert(Slot::Tombstone(tombstone));
                let outcome = if was_live {
                    MergeOutcome::Deleted
                } else {
                    MergeOutcome::Absent
                };
                (outcome, tombstone)
            }
            Entry::Vacant(v) => match ts {
                Some(ts) if ts > self.floor() => {
                    v.insert(Slot::Tombstone(ts));
                    (MergeOutcome::Absent, ts)
                }
                _ => (MergeOutcome::Absent, Timestamp::ZERO),
            },
        };

        if outcome == MergeOutcome::Deleted {
            self.commit(id, ChangeKind::Deleted, tombstone);
        }
        outcome
    }

    /// Delete every live entry matching `predicate` at `ts`. Returns the
    /// number of entries removed.
    pub fn delete_where<P>(&self, predicate: P, ts: Timestamp) -> usize
    where
        P: Fn(&T) -> bool,
    {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter_map(|r| match r.value() {
                Slot::Live(live) if predicate(&live.entry.value) => Some(r.key().clone()),
                _ => None,
            })
            .collect();

        ids.iter()
            .filter(|id| self.apply_delete_at(id, ts) == MergeOutcome::Deleted)
            .count()
    }

    // =========================================================================
    // Optimistic mutations
    // =========================================================================

    /// Apply a local mutation before the server confirms it.
    ///
    /// The entry is stamped one past its current timestamp and marked
    /// provisional. The transform is kept until the mutation is confirmed or
    /// rolled back, so it can be replayed when older pending mutations are
    /// undone or the server state underneath changes. Returns `None` when the
    /// entry is not cached.
    pub fn apply_optimistic<F>(&self, id: &str, transform: F) -> Option<OptimisticToken<T>>
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        let applied_at = {
            let mut slot = self.slots.get_mut(id)?;
            let Slot::Live(live) = &mut *slot else {
                return None;
            };
            live.push_optimistic(Arc::new(transform))
        };

        debug!(kind = T::KIND, id, ts = %applied_at, "applied optimistic mutation");
        self.commit(id, ChangeKind::Updated, applied_at);
        Some(OptimisticToken {
            id: id.to_string(),
            applied_at,
            _entity: PhantomData,
        })
    }

    /// Undo an optimistic mutation.
    ///
    /// The mutation is removed from the entry's pending stack and the entry
    /// is rebuilt from the last confirmed state plus the mutations still
    /// pending. Once the server has confirmed or superseded the mutation, or
    /// the entry was deleted, this is a no-op. Returns true if the mutation
    /// was undone.
    pub fn rollback(&self, token: OptimisticToken<T>) -> bool {
        let reverted = match self.slots.get_mut(&token.id) {
            Some(mut slot) => match &mut *slot {
                Slot::Live(live) => live
                    .revert(token.applied_at)
                    .then_some(live.entry.last_applied),
                Slot::Tombstone(_) => None,
            },
            None => None,
        };

        match reverted {
            Some(ts) => {
                debug!(kind = T::KIND, id = %token.id, undone = %token.applied_at, "rolled back optimistic mutation");
                self.commit(&token.id, ChangeKind::RolledBack, ts);
                true
            }
            None => {
                trace!(kind = T::KIND, id = %token.id, "optimistic mutation superseded, nothing to roll back");
                false
            }
        }
    }

    // =========================================================================
    // Tombstones
    // =========================================================================

    /// Record that the cache was fully hydrated at `version`.
    ///
    /// Creates and updates at or below the floor are rejected for ids the
    /// cache does not hold, so tombstones at or below it carry no more
    /// information and are dropped. Returns the number of tombstones pruned.
    pub fn advance_floor(&self, version: Timestamp) -> usize {
        let floor = Timestamp(self.floor.fetch_max(version.0, Ordering::SeqCst).max(version.0));
        let mut pruned = 0;
        self.slots.retain(|_, slot| match slot {
            Slot::Tombstone(deleted_at) if *deleted_at <= floor => {
                pruned += 1;
                false
            }
            _ => true,
        });
        if pruned > 0 {
            debug!(kind = T::KIND, pruned, %floor, "pruned tombstones");
        }
        pruned
    }

    /// Number of remembered deletes.
    pub fn tombstone_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|r| matches!(r.value(), Slot::Tombstone(_)))
            .count()
    }

    // =========================================================================
    // Projections
    // =========================================================================

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<T> {
        self.get_entry(id).map(|e| e.value)
    }

    /// Get an entity with its ordering metadata.
    pub fn get_entry(&self, id: &str) -> Option<CachedEntry<T>> {
        self.slots.get(id).and_then(|slot| match &*slot {
            Slot::Live(live) => Some(live.entry.clone()),
            Slot::Tombstone(_) => None,
        })
    }

    /// Timestamp of the last mutation applied to an entry.
    pub fn last_applied(&self, id: &str) -> Option<Timestamp> {
        self.slots.get(id).and_then(|slot| match &*slot {
            Slot::Live(live) => Some(live.entry.last_applied),
            Slot::Tombstone(_) => None,
        })
    }

    /// Whether an id was deleted and is still tombstoned.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| matches!(&*slot, Slot::Tombstone(_)))
    }

    /// All entities, ordered by id.
    pub fn list(&self) -> Vec<T> {
        self.list_where(|_| true)
    }

    /// Entities matching `predicate`, ordered by id.
    pub fn list_where<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut items: Vec<(String, T)> = self
            .slots
            .iter()
            .filter_map(|r| match r.value() {
                Slot::Live(live) if predicate(&live.entry.value) => {
                    Some((r.key().clone(), live.entry.value.clone()))
                }
                _ => None,
            })
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.into_iter().map(|(_, v)| v).collect()
    }

    /// Visit every live entity without cloning.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&T),
    {
        for r in self.slots.iter() {
            if let Slot::Live(live) = r.value() {
                f(&live.entry.value);
            }
        }
    }

    /// Count entities matching `predicate`.
    pub fn count_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        let mut count = 0;
        self.for_each(|v| {
            if predicate(v) {
                count += 1;
            }
        });
        count
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.count_where(|_| true)
    }

    /// Whether no live entities are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry and tombstone, and reset the hydration floor.
    pub fn clear(&self) {
        self.slots.clear();
        self.floor.store(0, Ordering::SeqCst);
        self.commit("", ChangeKind::Cleared, Timestamp::ZERO);
    }
}

impl<T: CacheEntry> Default for DomainCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn change_kind(outcome: MergeOutcome) -> ChangeKind {
    match outcome {
        MergeOutcome::Created => ChangeKind::Created,
        MergeOutcome::Deleted => ChangeKind::Deleted,
        _ => ChangeKind::Updated,
    }
}
