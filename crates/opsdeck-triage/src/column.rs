use std::fmt;
use std::str::FromStr;

use opsdeck_core::model::task::{ParseEnumError, Task, TaskStatus};
use serde::{Deserialize, Serialize};

/// Board columns, left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    Inbox,
    InProgress,
    Review,
    Done,
}

impl KanbanColumn {
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

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Inbox => "Inbox",
            Self::InProgress => "In Progress",
            Self::Review => "Review",
            Self::Done => "Done",
        }
    }

    /// Column for a raw status string. Anything unrecognized lands in
    /// `inbox`.
    pub fn from_status(status: &str) -> Self {
        status
            .parse::<TaskStatus>()
            .map_or(Self::Inbox, Self::from)
    }

    pub fn of(task: &Task) -> Self {
        Self::from_status(&task.status)
    }

    /// Status written to a task dropped into this column.
    #[must_use]
    pub const fn status(self) -> TaskStatus {
        match self {
            Self::Inbox => TaskStatus::Inbox,
            Self::InProgress => TaskStatus::InProgress,
            Self::Review => TaskStatus::Review,
            Self::Done => TaskStatus::Done,
        }
    }
}

impl From<TaskStatus> for KanbanColumn {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Inbox => Self::Inbox,
            TaskStatus::InProgress => Self::InProgress,
            TaskStatus::Review => Self::Review,
            TaskStatus::Done => Self::Done,
        }
    }
}

impl fmt::Display for KanbanColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KanbanColumn {
    type Err = ParseEnumError;

    /// Strict parse for user input; unlike [`KanbanColumn::from_status`]
    /// unknown names are an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<TaskStatus>()
            .map(Self::from)
            .map_err(|_| ParseEnumError {
                expected: "column",
                got: s.to_string(),
            })
    }
}
