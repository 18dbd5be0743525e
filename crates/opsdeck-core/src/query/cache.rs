//! Process-wide keyed store of query snapshots.
//!
//! [`QueryCache`] is the single shared-mutable resource of the sync core.
//! Reads, optimistic patches, and stream merges all write through it, and
//! every write is published to the key's subscribers.
//!
//! # Consistency
//!
//! All state sits behind one mutex. A [`CacheTxn`] holds that mutex for its
//! whole closure and publishes notifications only after its last write, so a
//! multi-key patch is observed either entirely or not at all.
//!
//! # Reads
//!
//! Every read is issued with a ticket. Cancelling a key (before an
//! optimistic patch, or when its last subscriber leaves) drops the ticket;
//! when the response eventually arrives it no longer matches and is ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::config::{CacheConfig, SyncConfig};
use crate::error::SyncError;
use crate::model::page::{Page, clamp_limit};
use crate::ports::{Clock, Identity, RequestPort, StaticIdentity, SystemClock};
use crate::query::entry::{QueryEntry, QueryStatus};
use crate::query::key::QueryKey;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct InFlight {
    ticket: u64,
    task: Option<JoinHandle<()>>,
}

struct Slot {
    entry: QueryEntry,
    notify: watch::Sender<QueryEntry>,
    observers: usize,
    in_flight: Option<InFlight>,
}

impl Slot {
    fn new() -> Self {
        let (notify, _) = watch::channel(QueryEntry::idle());
        Self {
            entry: QueryEntry::idle(),
            notify,
            observers: 0,
            in_flight: None,
        }
    }

    fn publish(&self) {
        self.notify.send_replace(self.entry.clone());
    }
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<QueryKey, Slot>,
    next_ticket: u64,
}

impl CacheState {
    fn slot_mut(&mut self, key: &QueryKey) -> &mut Slot {
        self.slots.entry(key.clone()).or_insert_with(Slot::new)
    }

    fn entry(&self, key: &QueryKey) -> QueryEntry {
        self.slots
            .get(key)
            .map_or_else(QueryEntry::idle, |slot| slot.entry.clone())
    }

    /// Drop the outstanding read for `key`. A key left in `loading` by the
    /// cancelled read falls back to `idle`; returns whether a read was
    /// outstanding and whether the entry changed.
    fn cancel(&mut self, key: &QueryKey) -> (bool, bool) {
        let Some(slot) = self.slots.get_mut(key) else {
            return (false, false);
        };
        let Some(in_flight) = slot.in_flight.take() else {
            return (false, false);
        };
        if let Some(task) = in_flight.task {
            task.abort();
        }
        trace!(%key, ticket = in_flight.ticket, "cancelled in-flight read");
        if slot.entry.status == QueryStatus::Loading {
            slot.entry = QueryEntry::idle();
            return (true, true);
        }
        (true, false)
    }

    fn begin_read(&mut self, key: &QueryKey) -> (u64, bool) {
        let (_, reverted) = self.cancel(key);
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let slot = self.slot_mut(key);
        slot.in_flight = Some(InFlight { ticket, task: None });
        // A revalidation keeps showing the successful data it replaces.
        let changed = if slot.entry.is_success() {
            reverted
        } else {
            slot.entry = QueryEntry::loading();
            true
        };
        (ticket, changed)
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Exclusive view of the cache for a batch of writes.
///
/// Obtained from [`QueryCache::transaction`]; subscribers are notified once
/// per touched key after the closure returns.
pub struct CacheTxn<'a> {
    state: &'a mut CacheState,
    touched: BTreeSet<QueryKey>,
}

impl CacheTxn<'_> {
    pub fn get(&self, key: &QueryKey) -> QueryEntry {
        self.state.entry(key)
    }

    pub fn set(&mut self, key: QueryKey, entry: QueryEntry) {
        self.state.slot_mut(&key).entry = entry;
        self.touched.insert(key);
    }

    /// Abort the outstanding read for `key`, if any.
    pub fn cancel_in_flight(&mut self, key: &QueryKey) -> bool {
        let (cancelled, changed) = self.state.cancel(key);
        if changed {
            self.touched.insert(key.clone());
        }
        cancelled
    }

    /// Keys whose current entry satisfies `predicate`.
    pub fn keys_where(
        &self,
        mut predicate: impl FnMut(&QueryKey, &QueryEntry) -> bool,
    ) -> BTreeSet<QueryKey> {
        self.state
            .slots
            .iter()
            .filter(|(key, slot)| predicate(key, &slot.entry))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

struct Shared {
    state: Mutex<CacheState>,
    requests: Arc<dyn RequestPort>,
    identity: Arc<dyn Identity>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    page_limit: Option<u32>,
}

/// Injectable, cloneable handle to one cache instance.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("keys", &self.lock().slots.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueryCache`]; only the request port is mandatory.
pub struct QueryCacheBuilder {
    requests: Arc<dyn RequestPort>,
    identity: Arc<dyn Identity>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    page_limit: Option<u32>,
}

impl QueryCacheBuilder {
    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn stale_after(mut self, window: chrono::Duration) -> Self {
        self.stale_after = window;
        self
    }

    /// Page size sent with reads whose key does not name a `limit`.
    #[must_use]
    pub fn page_limit(mut self, limit: u32) -> Self {
        self.page_limit = Some(clamp_limit(limit));
        self
    }

    /// Take the freshness window and page size from `config`.
    #[must_use]
    pub fn config(self, config: &SyncConfig) -> Self {
        self.stale_after(config.cache.stale_after())
            .page_limit(config.api.page_limit)
    }

    pub fn build(self) -> QueryCache {
        QueryCache {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState::default()),
                requests: self.requests,
                identity: self.identity,
                clock: self.clock,
                stale_after: self.stale_after,
                page_limit: self.page_limit,
            }),
        }
    }
}

impl QueryCache {
    /// Start building a cache. Defaults: signed in as `anonymous`, system
    /// clock, the default `[cache]` freshness window, and reads sent
    /// without a page size.
    pub fn builder(requests: Arc<dyn RequestPort>) -> QueryCacheBuilder {
        QueryCacheBuilder {
            requests,
            identity: Arc::new(StaticIdentity::signed_in("anonymous")),
            clock: Arc::new(SystemClock),
            stale_after: CacheConfig::default().stale_after(),
            page_limit: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn requests(&self) -> Arc<dyn RequestPort> {
        Arc::clone(&self.shared.requests)
    }

    pub fn is_signed_in(&self) -> bool {
        self.shared.identity.is_signed_in()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Run `f` with exclusive access; notifications go out after it returns.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut CacheTxn<'_>) -> R) -> R {
        let mut state = self.lock();
        let mut txn = CacheTxn {
            state: &mut state,
            touched: BTreeSet::new(),
        };
        let out = f(&mut txn);
        let touched = std::mem::take(&mut txn.touched);
        for key in &touched {
            if let Some(slot) = state.slots.get(key) {
                slot.publish();
            }
        }
        out
    }

    /// Current entry for `key`; never-loaded keys read as `idle`.
    pub fn get(&self, key: &QueryKey) -> QueryEntry {
        self.lock().entry(key)
    }

    pub fn set(&self, key: &QueryKey, entry: QueryEntry) {
        self.transaction(|txn| txn.set(key.clone(), entry));
    }

    /// Read-modify-write of one entry. Subscribers are notified only when
    /// the entry actually changed.
    pub fn update<R>(&self, key: &QueryKey, f: impl FnOnce(&mut QueryEntry) -> R) -> R {
        self.transaction(|txn| {
            let before = txn.get(key);
            let mut after = before.clone();
            let out = f(&mut after);
            if after != before {
                txn.set(key.clone(), after);
            }
            out
        })
    }

    /// Mark `key` stale and, when someone is observing it, schedule a
    /// re-fetch.
    #[instrument(skip(self), fields(%key))]
    pub fn invalidate(&self, key: &QueryKey) {
        let refetch = {
            let mut state = self.lock();
            let slot = state.slot_mut(key);
            slot.entry.stale = true;
            slot.publish();
            slot.observers > 0
        };
        if refetch && self.is_signed_in() {
            self.spawn_read(key.clone());
        }
    }

    /// Abort an outstanding read so its late response cannot overwrite
    /// newer state.
    pub fn cancel_in_flight(&self, key: &QueryKey) -> bool {
        self.transaction(|txn| txn.cancel_in_flight(key))
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.lock()
            .slots
            .get(key)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.lock().slots.get(key).map_or(0, |slot| slot.observers)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.lock().slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cancel every read and drop all cached data, e.g. after sign-out.
    pub fn reset(&self) {
        self.transaction(|txn| {
            let keys = txn.keys_where(|_, _| true);
            for key in keys {
                txn.cancel_in_flight(&key);
                txn.set(key, QueryEntry::idle());
            }
        });
    }

    /// Register an observer of `key` (the `useQuery` hook).
    ///
    /// Triggers a background read when the entry is missing, errored, stale,
    /// or older than the freshness window. Dropping the returned
    /// [`Subscription`] unregisters it.
    pub fn subscribe(&self, key: &QueryKey) -> Subscription {
        let now = self.now();
        let signed_in = self.is_signed_in();
        let (receiver, needs_read) = {
            let mut state = self.lock();
            let slot = state.slot_mut(key);
            slot.observers += 1;
            let needs_read = signed_in
                && slot.in_flight.is_none()
                && slot.entry.needs_fetch(now, self.shared.stale_after);
            (slot.notify.subscribe(), needs_read)
        };
        if needs_read {
            self.spawn_read(key.clone());
        }
        Subscription {
            key: key.clone(),
            cache: self.clone(),
            receiver,
        }
    }

    /// Read `key` now and return the resulting entry.
    ///
    /// While signed out nothing is requested and the cached entry is
    /// returned unchanged.
    #[instrument(skip(self), fields(%key))]
    pub async fn fetch(&self, key: &QueryKey) -> QueryEntry {
        if !self.is_signed_in() {
            debug!("signed out; read skipped");
            return self.get(key);
        }
        let ticket = self.begin_read(key);
        self.run_read(key, ticket).await;
        self.get(key)
    }

    fn begin_read(&self, key: &QueryKey) -> u64 {
        let mut state = self.lock();
        let (ticket, changed) = state.begin_read(key);
        if changed {
            state.slot_mut(key).publish();
        }
        ticket
    }

    fn spawn_read(&self, key: QueryKey) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%key, "no async runtime; background read skipped");
            return;
        };
        let ticket = self.begin_read(&key);
        let cache = self.clone();
        let task_key = key.clone();
        let task = runtime.spawn(async move { cache.run_read(&task_key, ticket).await });

        let mut state = self.lock();
        if let Some(in_flight) = state
            .slots
            .get_mut(&key)
            .and_then(|slot| slot.in_flight.as_mut())
            .filter(|in_flight| in_flight.ticket == ticket)
        {
            in_flight.task = Some(task);
        }
    }

    /// The key as sent to the backend: the configured page size is added
    /// unless the key already carries one.
    fn request_key(&self, key: &QueryKey) -> QueryKey {
        match self.shared.page_limit {
            Some(limit) if key.get("limit").is_none() => key.clone().param("limit", limit),
            _ => key.clone(),
        }
    }

    async fn run_read(&self, key: &QueryKey, ticket: u64) {
        let request = self.request_key(key);
        let result = match self.shared.requests.list(&request).await {
            Ok(response) => response.into_result().and_then(|body| {
                Page::from_body(body).map_err(|err| SyncError::Malformed(err.to_string()))
            }),
            Err(err) => Err(SyncError::network(format!("{err:#}"))),
        };
        self.complete_read(key, ticket, result);
    }

    fn complete_read(&self, key: &QueryKey, ticket: u64, result: Result<Page, SyncError>) {
        let now = self.now();
        let mut state = self.lock();
        let slot = state.slot_mut(key);
        let current = slot
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.ticket == ticket);
        if !current {
            debug!(%key, ticket, "discarding response of cancelled read");
            return;
        }
        slot.in_flight = None;
        slot.entry = match result {
            Ok(page) => {
                trace!(%key, items = page.items.len(), "read complete");
                QueryEntry::from_page(page, now)
            }
            Err(err) => {
                warn!(%key, error = %err, "read failed");
                QueryEntry::failed(&err, now)
            }
        };
        slot.publish();
    }

    fn release(&self, key: &QueryKey) {
        let mut state = self.lock();
        let last = match state.slots.get_mut(key) {
            Some(slot) => {
                slot.observers = slot.observers.saturating_sub(1);
                slot.observers == 0
            }
            None => false,
        };
        if last {
            let (_, changed) = state.cancel(key);
            if changed {
                state.slot_mut(key).publish();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A mounted observer of one query key.
pub struct Subscription {
    key: QueryKey,
    cache: QueryCache,
    receiver: watch::Receiver<QueryEntry>,
}

impl Subscription {
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The latest published entry.
    pub fn current(&self) -> QueryEntry {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published entry.
    pub async fn changed(&mut self) -> Option<QueryEntry> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until an entry satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&QueryEntry) -> bool,
    ) -> Option<QueryEntry> {
        let entry = self.receiver.wait_for(|entry| predicate(entry)).await.ok()?;
        Some(entry.clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
