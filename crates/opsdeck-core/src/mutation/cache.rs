//! Optimistic writes on top of the query cache.
//!
//! A mutation moves through three steps:
//!
//! 1. [`MutationCache::begin`] reserves the (collection, item id, kind)
//!    triple, cancels
//!    outstanding reads of every target key, snapshots the targets and
//!    applies the patch. All of it happens in one cache transaction, so
//!    readers see either the old state or the fully patched one.
//! 2. The caller issues the remote call ([`MutationCache::submit`] does this
//!    through the request port).
//! 3. [`MutationCache::resolve`] commits (targets are invalidated for
//!    revalidation) or rolls back (every snapshot is restored verbatim, and
//!    restored keys that were stale or mid-read are invalidated again).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::SyncError;
use crate::mutation::descriptor::{MutationDescriptor, Targets};
use crate::mutation::patch::PatchEffect;
use crate::mutation::pending::{MutationState, PendingMutation, Reservations};
use crate::query::cache::{CacheTxn, QueryCache};
use crate::query::entry::QueryEntry;
use crate::query::key::QueryKey;

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub mutation_id: u64,
    pub state: MutationState,
    pub target_keys: BTreeSet<QueryKey>,
    /// Body returned by the server.
    pub response: Value,
}

/// Optimistic mutation engine bound to one [`QueryCache`].
#[derive(Debug, Clone)]
pub struct MutationCache {
    cache: QueryCache,
    reservations: Reservations,
    next_id: Arc<AtomicU64>,
}

impl MutationCache {
    pub fn new(cache: QueryCache) -> Self {
        Self {
            cache,
            reservations: Reservations::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub const fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub const fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    /// Apply `descriptor` optimistically.
    ///
    /// # Errors
    ///
    /// - [`SyncError::SignedOut`] while signed out; nothing is touched.
    /// - [`SyncError::Conflict`] when a mutation of the same kind is already
    ///   pending for the item in the same collection.
    #[instrument(skip(self, descriptor), fields(item = %descriptor.item_id, kind = %descriptor.kind))]
    pub fn begin(&self, descriptor: MutationDescriptor) -> Result<PendingMutation, SyncError> {
        if !self.cache.is_signed_in() {
            return Err(SyncError::SignedOut);
        }
        let reservation = self
            .reservations
            .reserve(&descriptor.collection, &descriptor.item_id, descriptor.kind)?;

        let (target_keys, snapshot, interrupted) = self.cache.transaction(|txn| {
            let targets = target_keys(txn, &descriptor);
            let mut snapshot = BTreeMap::new();
            let mut interrupted = BTreeSet::new();
            for key in &targets {
                if txn.cancel_in_flight(key) {
                    interrupted.insert(key.clone());
                }
                let before = txn.get(key);
                let mut after = before.clone();
                let effect = descriptor.patch.apply(&mut after);
                if effect != PatchEffect::Untouched {
                    txn.set(key.clone(), after);
                }
                debug!(%key, ?effect, "optimistic patch applied");
                snapshot.insert(key.clone(), before);
            }
            (targets, snapshot, interrupted)
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(mutation = id, targets = target_keys.len(), "mutation applied");
        Ok(PendingMutation {
            id,
            descriptor,
            target_keys,
            snapshot,
            interrupted,
            state: MutationState::Applied,
            reservation: Some(reservation),
            cache: self.cache.clone(),
        })
    }

    /// Settle `pending` with the server's answer.
    ///
    /// On success the patched shape stays and every target key is
    /// invalidated. On failure every snapshot is restored in one transaction
    /// and the error is returned; restored keys that were stale, or whose
    /// read `begin` cancelled, are invalidated so revalidation resumes.
    ///
    /// # Errors
    ///
    /// Returns the server or transport error after rolling back.
    #[instrument(skip_all, fields(mutation = pending.id))]
    pub fn resolve(
        &self,
        mut pending: PendingMutation,
        result: Result<Value, SyncError>,
    ) -> Result<MutationOutcome, SyncError> {
        match result {
            Ok(response) => {
                if let Err(err) = pending.transition(MutationState::Committed) {
                    warn!(error = %err, "ignoring duplicate resolution");
                }
                for key in &pending.target_keys {
                    self.cache.invalidate(key);
                }
                info!(item = %pending.descriptor.item_id, "mutation committed");
                Ok(MutationOutcome {
                    mutation_id: pending.id,
                    state: pending.state,
                    target_keys: pending.target_keys.clone(),
                    response,
                })
            }
            Err(err) => {
                let snapshot = std::mem::take(&mut pending.snapshot);
                let revalidate: Vec<QueryKey> = snapshot
                    .iter()
                    .filter(|(key, entry)| entry.stale || pending.interrupted.contains(*key))
                    .map(|(key, _)| key.clone())
                    .collect();
                self.cache.transaction(|txn| {
                    for (key, entry) in snapshot {
                        txn.set(key, entry);
                    }
                });
                for key in &revalidate {
                    self.cache.invalidate(key);
                }
                if let Err(transition) = pending.transition(MutationState::RolledBack) {
                    warn!(error = %transition, "ignoring duplicate resolution");
                }
                warn!(item = %pending.descriptor.item_id, error = %err, "mutation rolled back");
                Err(err)
            }
        }
    }

    /// Apply, issue through the request port, and resolve.
    ///
    /// # Errors
    ///
    /// Returns the error from [`Self::begin`], or the network/server error
    /// that caused the rollback.
    pub async fn submit(&self, descriptor: MutationDescriptor) -> Result<MutationOutcome, SyncError> {
        let request = descriptor.to_request();
        let pending = self.begin(descriptor)?;
        let result = match self.cache.requests().mutate(&request).await {
            Ok(response) => response.into_result(),
            Err(err) => Err(SyncError::network(format!("{err:#}"))),
        };
        self.resolve(pending, result)
    }
}

fn target_keys(txn: &CacheTxn<'_>, descriptor: &MutationDescriptor) -> BTreeSet<QueryKey> {
    match &descriptor.targets {
        Targets::Keys(keys) => keys.clone(),
        Targets::Containing => txn.keys_where(|key, entry: &QueryEntry| {
            key.is_collection(&descriptor.collection)
                && entry.is_success()
                && entry.contains(&descriptor.item_id)
        }),
    }
}
