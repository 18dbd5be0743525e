//! Live stream integration tests on virtual time.
//!
//! A scripted transport plays one session per connect. Backoff delays run
//! on tokio's paused clock, so reconnect timing is exact.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use opsdeck_core::config::StreamConfig;
use opsdeck_core::model::item::Item;
use opsdeck_core::ports::{
    ApiResponse, MutationRequest, RequestPort, StaticIdentity, StreamFrame, StreamMessage,
    StreamTransport,
};
use opsdeck_core::query::{QueryCache, QueryEntry, QueryKey};
use opsdeck_core::stream::{ConnectionState, LiveStreams, StreamStatus, TotalPolicy};
use opsdeck_core::SyncError;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct NoRequests;

#[async_trait]
impl RequestPort for NoRequests {
    async fn list(&self, _key: &QueryKey) -> anyhow::Result<ApiResponse> {
        anyhow::bail!("reads are not used here")
    }

    async fn mutate(&self, _request: &MutationRequest) -> anyhow::Result<ApiResponse> {
        anyhow::bail!("mutations are not used here")
    }
}

enum Session {
    Refuse(&'static str),
    /// Deliver `messages`; keep the connection open afterwards when `hold`.
    Deliver {
        messages: Vec<StreamMessage>,
        hold: bool,
    },
}

struct ScriptedStream {
    sessions: Mutex<VecDeque<Session>>,
    cursors: Mutex<Vec<Option<String>>>,
    held: Mutex<Vec<mpsc::Sender<StreamMessage>>>,
    resumable: bool,
}

impl ScriptedStream {
    fn new(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            cursors: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            resumable: true,
        })
    }

    fn without_resume(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            cursors: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            resumable: false,
        })
    }

    fn push_session(&self, session: Session) {
        self.sessions.lock().unwrap().push_back(session);
    }

    fn connects(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }

    fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }

    /// Push onto the most recent held connection; `false` once its reader
    /// is gone.
    fn push(&self, message: StreamMessage) -> bool {
        self.held
            .lock()
            .unwrap()
            .last()
            .is_some_and(|tx| tx.try_send(message).is_ok())
    }
}

#[async_trait]
impl StreamTransport for ScriptedStream {
    async fn connect(
        &self,
        _endpoint: &str,
        resume_from: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<StreamMessage>> {
        self.cursors
            .lock()
            .unwrap()
            .push(resume_from.map(str::to_string));
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Session::Refuse("connection refused"));
        match session {
            Session::Refuse(reason) => anyhow::bail!(reason),
            Session::Deliver { messages, hold } => {
                let (tx, rx) = mpsc::channel(messages.len() + 16);
                for message in messages {
                    tx.try_send(message)
                        .map_err(|_| anyhow::anyhow!("script larger than channel"))?;
                }
                if hold {
                    self.held.lock().unwrap().push(tx);
                }
                Ok(rx)
            }
        }
    }

    fn supports_resume(&self) -> bool {
        self.resumable
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ENDPOINT: &str = "/api/v1/boards/b1/activity/stream";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
}

fn event(event_id: &str, item_id: &str, secs: i64) -> StreamMessage {
    StreamMessage::Event(StreamFrame {
        event_id: event_id.to_string(),
        payload: json!({
            "id": item_id,
            "created_at": at(secs).to_rfc3339(),
            "message": format!("{item_id} at {secs}"),
        }),
    })
}

fn raw(event_id: &str, payload: Value) -> StreamMessage {
    StreamMessage::Event(StreamFrame {
        event_id: event_id.to_string(),
        payload,
    })
}

fn config() -> StreamConfig {
    StreamConfig {
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter: 0.0,
        max_retries: Some(2),
        jitter_seed: Some(7),
        ..StreamConfig::default()
    }
}

fn feed_key() -> QueryKey {
    QueryKey::new("activity").param("board_id", "b1")
}

fn seeded_cache() -> QueryCache {
    let cache = QueryCache::builder(Arc::new(NoRequests)).build();
    cache.set(
        &feed_key(),
        QueryEntry::success(
            vec![Item::new("seed").created(at(0))],
            Some(1),
            at(0),
        ),
    );
    cache
}

fn ids(cache: &QueryCache) -> Vec<String> {
    cache
        .get(&feed_key())
        .items()
        .iter()
        .map(|item| item.id.to_string())
        .collect()
}

async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn events_merge_newest_first_and_count_inserts() {
    let transport = ScriptedStream::new(vec![Session::Deliver {
        messages: vec![event("1", "a", 10), event("2", "b", 5), event("3", "a", 10)],
        hold: true,
    }]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport.clone(), config());
    let mut sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    sub.wait_for(StreamStatus::is_live).await.unwrap();
    settle(|| ids(&cache).len() == 3).await;
    assert_eq!(ids(&cache), ["a", "b", "seed"]);
    assert_eq!(cache.get(&feed_key()).total, Some(3));
    assert_eq!(
        streams.connection(ENDPOINT).unwrap().last_event_id(),
        Some("3")
    );
}

#[tokio::test(start_paused = true)]
async fn empty_stream_leaves_entry_untouched() {
    let transport = ScriptedStream::new(vec![Session::Deliver {
        messages: vec![],
        hold: true,
    }]);
    let cache = seeded_cache();
    let before = cache.get(&feed_key());
    let streams = LiveStreams::new(cache.clone(), transport, config());
    let mut sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    sub.wait_for(StreamStatus::is_live).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(cache.get(&feed_key()), before);
    assert_eq!(sub.status(), StreamStatus::Live);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_from_last_event_after_backoff() {
    let transport = ScriptedStream::new(vec![
        Session::Deliver {
            messages: vec![event("e1", "a", 1), event("e2", "b", 2)],
            hold: false,
        },
        Session::Refuse("502 bad gateway"),
        Session::Deliver {
            messages: vec![event("e3", "c", 3)],
            hold: true,
        },
    ]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport.clone(), config());
    let started = Instant::now();
    let _sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    settle(|| ids(&cache).len() == 4).await;
    assert_eq!(ids(&cache), ["c", "b", "a", "seed"]);
    assert_eq!(
        transport.cursors(),
        [None, Some("e2".to_string()), Some("e2".to_string())]
    );
    // Retries were reset by the first session's events: 100ms then 200ms.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(streams.connection(ENDPOINT).unwrap().retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn replayed_events_are_not_merged_twice() {
    let transport = ScriptedStream::without_resume(vec![
        Session::Deliver {
            messages: vec![event("e1", "a", 1), event("e2", "b", 2)],
            hold: false,
        },
        Session::Deliver {
            // Full replay with the same event ids, then a redelivered item
            // under a fresh event id.
            messages: vec![
                event("e1", "a", 1),
                event("e2", "b", 2),
                event("e9", "b", 2),
                event("e10", "c", 3),
            ],
            hold: true,
        },
    ]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport.clone(), config());
    let _sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    settle(|| ids(&cache).len() == 4).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ids(&cache), ["c", "b", "a", "seed"]);
    assert_eq!(cache.get(&feed_key()).total, Some(4));
    assert_eq!(transport.cursors(), [None, None]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_failure_until_manual_retry() {
    let transport = ScriptedStream::new(vec![]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport.clone(), config());
    let started = Instant::now();
    let mut sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    let failed = sub
        .wait_for(|status| matches!(status, StreamStatus::Failed(_)))
        .await
        .unwrap();
    let err = failed.error().unwrap().clone();
    assert!(matches!(
        err,
        SyncError::Stream {
            retries_exhausted: true,
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(err.code().code(), "E4002");
    assert_eq!(transport.connects(), 3);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));

    // Nothing happens on its own once failed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connects(), 3);

    transport.push_session(Session::Deliver {
        messages: vec![event("late", "z", 9)],
        hold: true,
    });
    assert!(sub.retry());
    sub.wait_for(StreamStatus::is_live).await.unwrap();
    settle(|| ids(&cache).first().map(String::as_str) == Some("z")).await;
    assert_eq!(streams.connection(ENDPOINT).unwrap().retry_count(), 0);
    assert!(!sub.retry());
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_closes_and_stops_delivery() {
    let transport = ScriptedStream::new(vec![
        Session::Deliver {
            messages: vec![event("1", "a", 1)],
            hold: true,
        },
        Session::Deliver {
            messages: vec![],
            hold: true,
        },
    ]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport.clone(), config());

    let first = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);
    let mut second = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);
    settle(|| ids(&cache).len() == 2).await;
    assert_eq!(transport.connects(), 1, "subscribers share one connection");

    drop(first);
    assert_eq!(streams.active_endpoints(), [ENDPOINT.to_string()]);
    drop(second);
    assert!(streams.active_endpoints().is_empty());
    assert!(streams.connection(ENDPOINT).is_none());

    let before = cache.get(&feed_key());
    transport.push(event("2", "b", 2));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cache.get(&feed_key()), before);

    // A new mount gets a fresh connection.
    second = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);
    second.wait_for(StreamStatus::is_live).await.unwrap();
    let connection = streams.connection(ENDPOINT).unwrap();
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.last_event_id(), None);
    assert_eq!(transport.cursors()[1], None);
}

#[tokio::test(start_paused = true)]
async fn remaining_subscriber_keeps_connection_live() {
    let transport = ScriptedStream::new(vec![Session::Deliver {
        messages: vec![],
        hold: true,
    }]);
    let streams = LiveStreams::new(seeded_cache(), transport, config());
    let mut sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);
    sub.wait_for(StreamStatus::is_live).await.unwrap();

    let status_probe = streams.subscribe(ENDPOINT, QueryKey::new("other"), TotalPolicy::Untracked);
    drop(sub);
    assert_eq!(status_probe.status(), StreamStatus::Live);
    drop(status_probe);
    assert!(streams.active_endpoints().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_payloads_are_skipped() {
    let transport = ScriptedStream::new(vec![Session::Deliver {
        messages: vec![
            raw("1", json!({"message": "no id"})),
            raw("2", json!("not an object")),
            event("3", "ok", 4),
        ],
        hold: true,
    }]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport.clone(), config());
    let sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    settle(|| ids(&cache).len() == 2).await;
    assert_eq!(ids(&cache), ["ok", "seed"]);
    assert!(sub.status().is_live());
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn untracked_policy_leaves_total_to_reads() {
    let transport = ScriptedStream::new(vec![Session::Deliver {
        messages: vec![event("1", "a", 1), event("2", "b", 2)],
        hold: true,
    }]);
    let cache = seeded_cache();
    let streams = LiveStreams::new(cache.clone(), transport, config());
    let _sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::Untracked);

    settle(|| ids(&cache).len() == 3).await;
    assert_eq!(cache.get(&feed_key()).total, Some(1));
}

#[tokio::test(start_paused = true)]
async fn signed_out_streams_are_disabled() {
    let transport = ScriptedStream::new(vec![]);
    let cache = QueryCache::builder(Arc::new(NoRequests))
        .identity(Arc::new(StaticIdentity::signed_out()))
        .build();
    let streams = LiveStreams::new(cache, transport.clone(), config());
    let sub = streams.subscribe(ENDPOINT, feed_key(), TotalPolicy::CountInserts);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sub.status(), StreamStatus::Disabled);
    assert_eq!(transport.connects(), 0);
    assert!(!sub.retry());
    assert!(streams.active_endpoints().is_empty());
}
