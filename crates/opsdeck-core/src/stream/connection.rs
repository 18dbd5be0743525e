use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection lifecycle of one live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Errored,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Errored => "errored",
            Self::Closed => "closed",
        }
    }

    /// Validate whether a transition from self to `target` is allowed.
    ///
    /// Valid transitions:
    /// - `idle -> connecting`
    /// - `connecting -> open`
    /// - `connecting -> errored`
    /// - `open -> errored`
    /// - `errored -> connecting` (reconnect after backoff)
    /// - any non-closed state `-> closed`
    pub fn can_transition_to(self, target: Self) -> Result<(), InvalidConnectionTransition> {
        if self == Self::Closed {
            return Err(InvalidConnectionTransition {
                from: self,
                to: target,
                reason: "closed connections are never reused",
            });
        }
        let allowed = matches!(
            (self, target),
            (Self::Idle | Self::Errored, Self::Connecting)
                | (Self::Connecting, Self::Open | Self::Errored)
                | (Self::Open, Self::Errored)
                | (_, Self::Closed)
        );
        if allowed {
            Ok(())
        } else {
            Err(InvalidConnectionTransition {
                from: self,
                to: target,
                reason: "transition not allowed by connection lifecycle",
            })
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a connection state transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidConnectionTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: &'static str,
}

impl fmt::Display for InvalidConnectionTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move {} -> {}: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for InvalidConnectionTransition {}

/// Bookkeeping for one endpoint's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConnection {
    pub endpoint: String,
    state: ConnectionState,
    retry_count: u32,
    last_event_id: Option<String>,
}

impl StreamConnection {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: ConnectionState::Idle,
            retry_count: 0,
            last_event_id: None,
        }
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Resume cursor: the id of the last event handed to the merge.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Move to `target`. Re-entering `connecting` from `errored` counts as
    /// one retry.
    ///
    /// # Errors
    ///
    /// Returns the rejected transition; the state is unchanged.
    pub fn transition(&mut self, target: ConnectionState) -> Result<(), InvalidConnectionTransition> {
        self.state.can_transition_to(target)?;
        if self.state == ConnectionState::Errored && target == ConnectionState::Connecting {
            self.retry_count = self.retry_count.saturating_add(1);
        }
        self.state = target;
        Ok(())
    }

    pub fn record_event(&mut self, event_id: &str) {
        self.last_event_id = Some(event_id.to_string());
    }

    pub const fn reset_retries(&mut self) {
        self.retry_count = 0;
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }
}
