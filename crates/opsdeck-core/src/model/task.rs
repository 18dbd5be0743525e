use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::item::{Item, ItemId};
use crate::model::timestamp;

/// The four task lifecycle states known to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Inbox,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub const ALL: [Self; 4] = [Self::Inbox, Self::InProgress, Self::Review, Self::Done];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "inbox" => Ok(Self::Inbox),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(ParseEnumError {
                expected: "task status",
                got: s.to_string(),
            }),
        }
    }
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_status() -> String {
    TaskStatus::Inbox.as_str().to_string()
}

/// Typed view of a task card as served by the board endpoints.
///
/// `status` stays a raw string: the server may introduce states this client
/// does not know yet, and classification must still place such tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: ItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub board_id: Option<String>,
    #[serde(default)]
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub depends_on_task_ids: Vec<String>,
    #[serde(default)]
    pub blocked_by_task_ids: Vec<String>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub approvals_count: u32,
    #[serde(default)]
    pub approvals_pending_count: u32,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub in_progress_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<ItemId>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: None,
            status: status.into(),
            priority: default_priority(),
            board_id: None,
            assigned_agent_id: None,
            assignee: None,
            depends_on_task_ids: Vec::new(),
            blocked_by_task_ids: Vec::new(),
            is_blocked: false,
            approvals_count: 0,
            approvals_pending_count: 0,
            due_at: None,
            in_progress_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Decode a task from a cached item.
    ///
    /// # Errors
    ///
    /// Returns the serde error when a known field has the wrong type.
    pub fn from_item(item: &Item) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(item)?)
    }

    /// Parsed status, or `None` for values this client does not recognize.
    pub fn known_status(&self) -> Option<TaskStatus> {
        self.status.parse().ok()
    }

    /// A task is blocked when the server says so or when it still has
    /// unfinished blockers listed.
    pub fn blocked(&self) -> bool {
        self.is_blocked || !self.blocked_by_task_ids.is_empty()
    }
}
