//! Live stream connections and their merge into the query cache.
//!
//! Subscriptions to the same endpoint share one connection task. The task
//! connects, forwards every admitted event into each subscribed key, and on
//! failure reconnects after an exponential backoff until the retry budget is
//! spent. When the last subscription drops the connection is closed and
//! forgotten; the next subscription starts a fresh one.
//!
//! Lock order is channels, then cache. Events are merged while the channel
//! lock is held, so once a channel is removed nothing more is delivered.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::StreamConfig;
use crate::error::SyncError;
use crate::model::item::Item;
use crate::ports::{StreamFrame, StreamMessage, StreamTransport};
use crate::query::cache::QueryCache;
use crate::query::key::QueryKey;
use crate::stream::backoff::BackoffPolicy;
use crate::stream::connection::{ConnectionState, StreamConnection};
use crate::stream::merge::{EventWindow, TotalPolicy, merge_item};

/// What subscribers of an endpoint are told about its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// Signed out; no connection is attempted.
    Disabled,
    Connecting,
    Live,
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted. Shown as a dismissible banner with a retry action.
    Failed(SyncError),
    Closed,
}

impl StreamStatus {
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    pub const fn error(&self) -> Option<&SyncError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Connecting => f.write_str("connecting"),
            Self::Live => f.write_str("live"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {}ms)", delay.as_millis())
            }
            Self::Failed(err) => write!(f, "failed: {err}"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Target {
    key: QueryKey,
    policy: TotalPolicy,
}

struct Channel {
    generation: u64,
    targets: BTreeMap<u64, Target>,
    status: watch::Sender<StreamStatus>,
    connection: StreamConnection,
    window: EventWindow,
    retry: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    fn publish(&self, status: StreamStatus) {
        self.status.send_replace(status);
    }

    fn move_to(&mut self, state: ConnectionState) {
        if let Err(err) = self.connection.transition(state) {
            debug!(endpoint = %self.connection.endpoint, error = %err, "connection transition rejected");
        }
    }

    /// Distinct target keys; the first subscription's policy wins on a
    /// shared key.
    fn keys(&self) -> BTreeMap<QueryKey, TotalPolicy> {
        let mut keys = BTreeMap::new();
        for target in self.targets.values() {
            keys.entry(target.key.clone()).or_insert(target.policy);
        }
        keys
    }
}

struct Inner {
    cache: QueryCache,
    transport: Arc<dyn StreamTransport>,
    config: StreamConfig,
    channels: Mutex<HashMap<String, Channel>>,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the live channel for `endpoint`, or return `None` when the
    /// connection this task serves has been closed.
    fn with_channel<R>(
        &self,
        endpoint: &str,
        generation: u64,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Option<R> {
        let mut channels = self.lock();
        let channel = channels
            .get_mut(endpoint)
            .filter(|channel| channel.generation == generation)?;
        Some(f(channel))
    }

    fn deliver(&self, endpoint: &str, generation: u64, frame: StreamFrame) -> Option<()> {
        self.with_channel(endpoint, generation, |channel| {
            if !channel.window.admit(&frame.event_id) {
                trace!(event = %frame.event_id, "duplicate event dropped");
                return;
            }
            channel.connection.record_event(&frame.event_id);
            channel.connection.reset_retries();

            let item = match Item::from_value(frame.payload) {
                Ok(item) => item,
                Err(err) => {
                    warn!(event = %frame.event_id, error = %err, "skipping malformed stream payload");
                    return;
                }
            };
            let keys = channel.keys();
            self.cache.transaction(|txn| {
                for (key, policy) in keys {
                    let mut entry = txn.get(&key);
                    let outcome = merge_item(&mut entry, item.clone(), policy);
                    trace!(%key, ?outcome, "stream item merged");
                    if outcome.changed() {
                        txn.set(key, entry);
                    }
                }
            });
        })
    }
}

// ---------------------------------------------------------------------------
// LiveStreams
// ---------------------------------------------------------------------------

/// Live Stream Merge Engine: one shared connection per endpoint.
#[derive(Clone)]
pub struct LiveStreams {
    inner: Arc<Inner>,
}

impl fmt::Debug for LiveStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStreams")
            .field("endpoints", &self.active_endpoints())
            .finish_non_exhaustive()
    }
}

impl LiveStreams {
    pub fn new(cache: QueryCache, transport: Arc<dyn StreamTransport>, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Merge events from `endpoint` into `key` for as long as the returned
    /// subscription lives.
    pub fn subscribe(
        &self,
        endpoint: &str,
        key: QueryKey,
        policy: TotalPolicy,
    ) -> StreamSubscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        if !self.inner.cache.is_signed_in() {
            debug!(endpoint, "signed out; stream disabled");
            let (_, status) = watch::channel(StreamStatus::Disabled);
            return StreamSubscription {
                id,
                endpoint: endpoint.to_string(),
                key,
                status,
                streams: None,
            };
        }

        let mut channels = self.inner.lock();
        let target = Target {
            key: key.clone(),
            policy,
        };
        let status = if let Some(channel) = channels.get_mut(endpoint) {
            channel.targets.insert(id, target);
            channel.status.subscribe()
        } else {
            let channel = self.open_channel(endpoint, id, target);
            let status = channel.status.subscribe();
            channels.insert(endpoint.to_string(), channel);
            status
        };
        drop(channels);

        StreamSubscription {
            id,
            endpoint: endpoint.to_string(),
            key,
            status,
            streams: Some(self.clone()),
        }
    }

    fn open_channel(&self, endpoint: &str, id: u64, target: Target) -> Channel {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (status, _) = watch::channel(StreamStatus::Connecting);
        let mut channel = Channel {
            generation,
            targets: BTreeMap::from([(id, target)]),
            status,
            connection: StreamConnection::new(endpoint),
            window: EventWindow::new(self.inner.config.dedup_window),
            retry: Arc::new(Notify::new()),
            task: None,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let span = info_span!("opsdeck.stream", endpoint = %endpoint, generation);
                let task = run_channel(Arc::clone(&self.inner), endpoint.to_string(), generation);
                channel.task = Some(runtime.spawn(task.instrument(span)));
                info!(endpoint, "stream opened");
            }
            Err(_) => {
                warn!(endpoint, "no async runtime; stream not started");
                channel.publish(StreamStatus::Failed(SyncError::Stream {
                    endpoint: endpoint.to_string(),
                    message: "no async runtime".to_string(),
                    retries_exhausted: true,
                }));
            }
        }
        channel
    }

    fn unsubscribe(&self, endpoint: &str, id: u64) {
        let mut channels = self.inner.lock();
        let Some(channel) = channels.get_mut(endpoint) else {
            return;
        };
        channel.targets.remove(&id);
        if !channel.targets.is_empty() {
            return;
        }
        if let Some(mut channel) = channels.remove(endpoint) {
            channel.move_to(ConnectionState::Closed);
            channel.publish(StreamStatus::Closed);
            if let Some(task) = channel.task.take() {
                task.abort();
            }
            info!(endpoint, "stream closed");
        }
    }

    /// Manual retry after the retry budget was spent. Returns whether a
    /// failed connection was woken.
    pub fn retry(&self, endpoint: &str) -> bool {
        let channels = self.inner.lock();
        let Some(channel) = channels.get(endpoint) else {
            return false;
        };
        if !matches!(*channel.status.borrow(), StreamStatus::Failed(_)) || channel.task.is_none() {
            return false;
        }
        info!(endpoint, "manual stream retry");
        channel.retry.notify_one();
        true
    }

    /// Snapshot of the connection bookkeeping for `endpoint`.
    pub fn connection(&self, endpoint: &str) -> Option<StreamConnection> {
        self.inner
            .lock()
            .get(endpoint)
            .map(|channel| channel.connection.clone())
    }

    pub fn active_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.inner.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}

enum Ended {
    Failed(String),
    Superseded,
}

enum Backoff {
    Sleep(Duration),
    AwaitRetry(Arc<Notify>),
}

async fn run_channel(inner: Arc<Inner>, endpoint: String, generation: u64) {
    let policy = BackoffPolicy::from_config(&inner.config);
    let mut rng = inner
        .config
        .jitter_seed
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let resumable = inner.config.resume && inner.transport.supports_resume();
    let mut manual_retry = false;

    loop {
        let Some(resume_from) = inner.with_channel(&endpoint, generation, |channel| {
            channel.move_to(ConnectionState::Connecting);
            if manual_retry {
                channel.connection.reset_retries();
            }
            if channel.connection.retry_count() == 0 {
                channel.publish(StreamStatus::Connecting);
            }
            channel.connection.last_event_id().map(str::to_string)
        }) else {
            return;
        };
        manual_retry = false;
        let resume_from = resume_from.filter(|_| resumable);

        let ended = match inner.transport.connect(&endpoint, resume_from.as_deref()).await {
            Ok(events) => consume(&inner, &endpoint, generation, events).await,
            Err(err) => Ended::Failed(format!("{err:#}")),
        };
        let message = match ended {
            Ended::Failed(message) => message,
            Ended::Superseded => return,
        };

        let Some(next) = inner.with_channel(&endpoint, generation, |channel| {
            channel.move_to(ConnectionState::Errored);
            let retries = channel.connection.retry_count();
            if policy.exhausted(retries) {
                warn!(retries, error = %message, "stream retries exhausted");
                channel.publish(StreamStatus::Failed(SyncError::Stream {
                    endpoint: endpoint.clone(),
                    message: message.clone(),
                    retries_exhausted: true,
                }));
                Backoff::AwaitRetry(Arc::clone(&channel.retry))
            } else {
                let delay = policy.delay(retries, &mut rng);
                debug!(retry = retries + 1, delay_ms = delay.as_millis(), error = %message, "stream reconnecting");
                channel.publish(StreamStatus::Reconnecting {
                    attempt: retries + 1,
                    delay,
                });
                Backoff::Sleep(delay)
            }
        }) else {
            return;
        };

        match next {
            Backoff::Sleep(delay) => tokio::time::sleep(delay).await,
            Backoff::AwaitRetry(retry) => {
                retry.notified().await;
                manual_retry = true;
            }
        }
    }
}

async fn consume(
    inner: &Inner,
    endpoint: &str,
    generation: u64,
    mut events: mpsc::Receiver<StreamMessage>,
) -> Ended {
    let opened = inner.with_channel(endpoint, generation, |channel| {
        channel.move_to(ConnectionState::Open);
        channel.publish(StreamStatus::Live);
    });
    if opened.is_none() {
        return Ended::Superseded;
    }

    loop {
        match events.recv().await {
            Some(StreamMessage::Event(frame)) => {
                if inner.deliver(endpoint, generation, frame).is_none() {
                    return Ended::Superseded;
                }
            }
            Some(StreamMessage::Error(message)) => return Ended::Failed(message),
            None => return Ended::Failed("stream closed by server".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamSubscription
// ---------------------------------------------------------------------------

/// A mounted consumer of one endpoint, merging into one query key.
pub struct StreamSubscription {
    id: u64,
    endpoint: String,
    key: QueryKey,
    status: watch::Receiver<StreamStatus>,
    streams: Option<LiveStreams>,
}

impl fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("key", &self.key)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl StreamSubscription {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Wait until the status satisfies `predicate`. Returns `None` once the
    /// connection is gone and the status can no longer change.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&StreamStatus) -> bool,
    ) -> Option<StreamStatus> {
        let status = self.status.wait_for(|status| predicate(status)).await.ok()?;
        Some(status.clone())
    }

    /// The banner's retry action.
    pub fn retry(&self) -> bool {
        self.streams
            .as_ref()
            .is_some_and(|streams| streams.retry(&self.endpoint))
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        if let Some(streams) = self.streams.take() {
            streams.unsubscribe(&self.endpoint, self.id);
        }
    }
}
