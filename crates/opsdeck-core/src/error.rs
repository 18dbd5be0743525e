use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::item::ItemId;
use crate::mutation::descriptor::MutationKind;

/// Machine-readable error codes for the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SignedOut,
    ConfigParseError,
    NetworkFailure,
    ServerRejected,
    MutationConflict,
    StreamFailure,
    StreamRetriesExhausted,
    MalformedPayload,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SignedOut => "E1001",
            Self::ConfigParseError => "E1002",
            Self::NetworkFailure => "E2001",
            Self::ServerRejected => "E2002",
            Self::MutationConflict => "E3001",
            Self::StreamFailure => "E4001",
            Self::StreamRetriesExhausted => "E4002",
            Self::MalformedPayload => "E5001",
        }
    }

    /// Short human-facing summary for logs and banners.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::SignedOut => "Not signed in",
            Self::ConfigParseError => "Config file parse error",
            Self::NetworkFailure => "Network request failed",
            Self::ServerRejected => "Server rejected the request",
            Self::MutationConflict => "Another change to this item is still pending",
            Self::StreamFailure => "Live updates interrupted",
            Self::StreamRetriesExhausted => "Live updates unavailable",
            Self::MalformedPayload => "Malformed payload",
        }
    }

    /// Optional remediation hint surfaced next to the error.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::SignedOut => Some("Sign in to load and edit dashboard data."),
            Self::ConfigParseError => Some("Fix syntax in the opsdeck config.toml and retry."),
            Self::NetworkFailure => Some("Check connectivity; the request can be retried."),
            Self::ServerRejected | Self::MalformedPayload => None,
            Self::MutationConflict => Some("Wait for the previous change to finish, then retry."),
            Self::StreamFailure => Some("Reconnecting automatically."),
            Self::StreamRetriesExhausted => Some("Use the retry action to reconnect live updates."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Every failure the sync core reports to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Transport failure; the request never produced a response.
    #[error("network error: {message}")]
    Network { message: String },

    /// Non-2xx response carrying the backend's structured detail.
    #[error("server error {status}: {detail}")]
    Server {
        status: u16,
        detail: String,
        request_id: Option<String>,
    },

    /// A mutation of the same kind is already pending for this item.
    #[error("{kind} already pending for {collection}/{item_id}")]
    Conflict {
        collection: String,
        item_id: ItemId,
        kind: MutationKind,
    },

    /// Connection-level stream failure.
    #[error("stream error on {endpoint}: {message}")]
    Stream {
        endpoint: String,
        message: String,
        retries_exhausted: bool,
    },

    #[error("not signed in")]
    SignedOut,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::NetworkFailure,
            Self::Server { .. } => ErrorCode::ServerRejected,
            Self::Conflict { .. } => ErrorCode::MutationConflict,
            Self::Stream {
                retries_exhausted: true,
                ..
            } => ErrorCode::StreamRetriesExhausted,
            Self::Stream { .. } => ErrorCode::StreamFailure,
            Self::SignedOut => ErrorCode::SignedOut,
            Self::Malformed(_) => ErrorCode::MalformedPayload,
        }
    }

    /// Whether retrying the same operation may succeed without user action.
    ///
    /// Server errors are never auto-retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Stream {
                retries_exhausted, ..
            } => !*retries_exhausted,
            _ => false,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Serializable projection of a [`SyncError`], stored on query entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl From<&SyncError> for ErrorInfo {
    fn from(err: &SyncError) -> Self {
        let request_id = match err {
            SyncError::Server { request_id, .. } => request_id.clone(),
            _ => None,
        };
        Self {
            code: err.code().code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            request_id,
        }
    }
}
