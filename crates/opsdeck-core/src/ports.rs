//! Collaborator ports.
//!
//! The sync core never talks to the network, the auth provider, or the wall
//! clock directly. Each of those is a trait here so the cache engines can be
//! driven by fakes in tests and by the generated API client in the app.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::model::item::ItemId;
use crate::mutation::descriptor::MutationKind;
use crate::query::key::QueryKey;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Signed-in state supplied by the auth provider.
pub trait Identity: Send + Sync {
    fn is_signed_in(&self) -> bool;

    /// Actor identifier; only meaningful while signed in.
    fn actor_id(&self) -> Option<String>;
}

/// Fixed identity, signed in exactly when an actor is present.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    actor: Option<String>,
}

impl StaticIdentity {
    pub fn signed_in(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
        }
    }

    #[must_use]
    pub const fn signed_out() -> Self {
        Self { actor: None }
    }
}

impl Identity for StaticIdentity {
    fn is_signed_in(&self) -> bool {
        self.actor.is_some()
    }

    fn actor_id(&self) -> Option<String> {
        self.actor.clone()
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Typed request collaborator
// ---------------------------------------------------------------------------

/// Raw `{ status, data }` pair returned by the generated request functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Split a response into its body or a [`SyncError::Server`].
    ///
    /// The backend's error envelope is `{"detail": ..., "request_id": ...}`;
    /// `detail` may be a string or a structured value (validation errors,
    /// blocked-task details), which is rendered as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Server`] for any status outside `200..=299`.
    pub fn into_result(self) -> Result<Value, SyncError> {
        if self.is_success() {
            return Ok(self.body);
        }
        let detail = match self.body.get("detail") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => format!("HTTP {}", self.status),
        };
        let request_id = self
            .body
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Err(SyncError::Server {
            status: self.status,
            detail,
            request_id,
        })
    }
}

/// A mutation as handed to the request collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub collection: String,
    pub kind: MutationKind,
    pub item_id: ItemId,
    pub body: Map<String, Value>,
}

/// Async request functions for reads and mutations.
///
/// An `Err` means the transport failed before any response arrived.
#[async_trait]
pub trait RequestPort: Send + Sync {
    async fn list(&self, key: &QueryKey) -> Result<ApiResponse>;

    async fn mutate(&self, request: &MutationRequest) -> Result<ApiResponse>;
}

// ---------------------------------------------------------------------------
// Stream transport collaborator
// ---------------------------------------------------------------------------

/// One `(event-id, payload)` pair pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub event_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(StreamFrame),
    /// Connection-level failure reported by the transport. The channel
    /// closing without this message is an orderly closure by the server.
    Error(String),
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a long-lived connection.
    ///
    /// `resume_from` is the last delivered event id, passed only when
    /// [`StreamTransport::supports_resume`] is true.
    async fn connect(
        &self,
        endpoint: &str,
        resume_from: Option<&str>,
    ) -> Result<mpsc::Receiver<StreamMessage>>;

    fn supports_resume(&self) -> bool {
        true
    }
}
