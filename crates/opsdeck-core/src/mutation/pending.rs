use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::model::item::ItemId;
use crate::mutation::descriptor::{MutationDescriptor, MutationKind};
use crate::query::cache::QueryCache;
use crate::query::entry::QueryEntry;
use crate::query::key::QueryKey;

/// Lifecycle of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Applied,
    Committed,
    RolledBack,
}

impl MutationState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Applied)
    }

    /// Validate whether a transition from self to `target` is allowed.
    ///
    /// Valid transitions:
    /// - `applied -> committed`
    /// - `applied -> rolled_back`
    pub fn can_transition_to(self, target: Self) -> Result<(), InvalidTransition> {
        if self == target {
            return Err(InvalidTransition {
                from: self,
                to: target,
                reason: "no-op transition is not allowed",
            });
        }
        if matches!(
            (self, target),
            (Self::Applied, Self::Committed | Self::RolledBack)
        ) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self,
                to: target,
                reason: "mutation already resolved",
            })
        }
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a mutation state transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: MutationState,
    pub to: MutationState,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move {} -> {}: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for InvalidTransition {}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

type ReservationKey = (String, ItemId, MutationKind);

/// The set of (collection, item id, kind) triples with a mutation
/// outstanding. Ids are only unique within a collection.
#[derive(Debug, Clone, Default)]
pub struct Reservations {
    held: Arc<Mutex<HashSet<ReservationKey>>>,
}

impl Reservations {
    fn lock(&self) -> MutexGuard<'_, HashSet<ReservationKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `(collection, item_id, kind)` until the returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conflict`] when the triple is already claimed.
    pub fn reserve(
        &self,
        collection: &str,
        item_id: &ItemId,
        kind: MutationKind,
    ) -> Result<Reservation, SyncError> {
        let key = (collection.to_string(), item_id.clone(), kind);
        if !self.lock().insert(key.clone()) {
            return Err(SyncError::Conflict {
                collection: collection.to_string(),
                item_id: item_id.clone(),
                kind,
            });
        }
        Ok(Reservation {
            key,
            held: Arc::clone(&self.held),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// RAII guard for one outstanding reservation.
#[derive(Debug)]
pub struct Reservation {
    key: ReservationKey,
    held: Arc<Mutex<HashSet<ReservationKey>>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// PendingMutation
// ---------------------------------------------------------------------------

/// An optimistic patch that has been applied and awaits the server.
///
/// Created by [`MutationCache::begin`](crate::mutation::MutationCache::begin)
/// and consumed by `resolve`. If it is dropped unresolved (for example the
/// submitting task was cancelled) the outcome is unknown, so its target keys
/// are invalidated and re-read from the server.
#[derive(Debug)]
pub struct PendingMutation {
    pub(crate) id: u64,
    pub(crate) descriptor: MutationDescriptor,
    pub(crate) target_keys: BTreeSet<QueryKey>,
    pub(crate) snapshot: BTreeMap<QueryKey, QueryEntry>,
    /// Targets whose read was cancelled when the patch landed.
    pub(crate) interrupted: BTreeSet<QueryKey>,
    pub(crate) state: MutationState,
    pub(crate) reservation: Option<Reservation>,
    pub(crate) cache: QueryCache,
}

impl PendingMutation {
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn descriptor(&self) -> &MutationDescriptor {
        &self.descriptor
    }

    pub const fn target_keys(&self) -> &BTreeSet<QueryKey> {
        &self.target_keys
    }

    /// Entries as they were immediately before the patch.
    pub const fn snapshot(&self) -> &BTreeMap<QueryKey, QueryEntry> {
        &self.snapshot
    }

    pub const fn state(&self) -> MutationState {
        self.state
    }

    pub(crate) fn transition(&mut self, target: MutationState) -> Result<(), InvalidTransition> {
        self.state.can_transition_to(target)?;
        self.state = target;
        if target.is_terminal() {
            self.reservation = None;
        }
        Ok(())
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        if self.state != MutationState::Applied {
            return;
        }
        warn!(
            mutation = self.id,
            item = %self.descriptor.item_id,
            kind = %self.descriptor.kind,
            "mutation dropped before resolution; revalidating targets"
        );
        for key in &self.target_keys {
            self.cache.invalidate(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_applied_can_resolve() {
        assert!(
            MutationState::Applied
                .can_transition_to(MutationState::Committed)
                .is_ok()
        );
        assert!(
            MutationState::Applied
                .can_transition_to(MutationState::RolledBack)
                .is_ok()
        );
        let err = MutationState::Committed
            .can_transition_to(MutationState::RolledBack)
            .unwrap_err();
        assert_eq!(err.reason, "mutation already resolved");
        assert!(
            MutationState::Applied
                .can_transition_to(MutationState::Applied)
                .is_err()
        );
    }

    #[test]
    fn reservation_is_exclusive_per_item_and_kind() {
        let reservations = Reservations::default();
        let id = ItemId::from("t-1");
        let guard = reservations
            .reserve("tasks", &id, MutationKind::Update)
            .unwrap();

        let err = reservations
            .reserve("tasks", &id, MutationKind::Update)
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
        // A different kind on the same item is independent.
        let delete = reservations
            .reserve("tasks", &id, MutationKind::Delete)
            .unwrap();
        assert_eq!(reservations.len(), 2);

        drop(guard);
        drop(delete);
        assert!(reservations.is_empty());
        assert!(
            reservations
                .reserve("tasks", &id, MutationKind::Update)
                .is_ok()
        );
    }

    #[test]
    fn same_id_in_another_collection_is_independent() {
        let reservations = Reservations::default();
        let id = ItemId::from(1_i64);
        let task = reservations
            .reserve("tasks", &id, MutationKind::Delete)
            .unwrap();
        let board = reservations
            .reserve("boards", &id, MutationKind::Delete)
            .unwrap();
        assert_eq!(reservations.len(), 2);

        let err = reservations
            .reserve("boards", &id, MutationKind::Delete)
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Conflict {
                collection: "boards".into(),
                item_id: id.clone(),
                kind: MutationKind::Delete,
            }
        );
        drop(task);
        drop(board);
        assert!(reservations.is_empty());
    }
}
