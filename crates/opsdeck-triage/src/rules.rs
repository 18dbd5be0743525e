//! Review-column triage rules.
//!
//! Rules are evaluated top to bottom and the first match wins, so a task
//! that is both blocked and awaiting approval is only ever `blocked`.

use std::fmt;
use std::str::FromStr;

use opsdeck_core::model::task::{ParseEnumError, Task};
use serde::{Deserialize, Serialize};

use crate::column::KanbanColumn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageBucket {
    Blocked,
    ApprovalNeeded,
    LeadReview,
    /// Every review-column task. A filter, never a classification result.
    All,
}

impl TriageBucket {
    /// Filters in the order the review column shows them.
    pub const FILTERS: [Self; 4] = [Self::All, Self::Blocked, Self::ApprovalNeeded, Self::LeadReview];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::ApprovalNeeded => "approval_needed",
            Self::LeadReview => "lead_review",
            Self::All => "all",
        }
    }
}

impl fmt::Display for TriageBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriageBucket {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "blocked" => Ok(Self::Blocked),
            "approval_needed" => Ok(Self::ApprovalNeeded),
            "lead_review" => Ok(Self::LeadReview),
            "all" => Ok(Self::All),
            _ => Err(ParseEnumError {
                expected: "triage bucket",
                got: s.to_string(),
            }),
        }
    }
}

/// One row of the precedence table.
#[derive(Clone, Copy)]
pub struct TriageRule {
    pub bucket: TriageBucket,
    pub label: &'static str,
    pub matches: fn(&Task) -> bool,
}

impl fmt::Debug for TriageRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriageRule")
            .field("bucket", &self.bucket)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn is_blocked(task: &Task) -> bool {
    task.blocked()
}

const fn needs_approval(task: &Task) -> bool {
    task.approvals_pending_count > 0
}

fn ready_for_lead(task: &Task) -> bool {
    KanbanColumn::of(task) == KanbanColumn::Review && !task.blocked() && task.approvals_pending_count == 0
}

/// Precedence order. Earlier rows win.
pub const TRIAGE_RULES: [TriageRule; 3] = [
    TriageRule {
        bucket: TriageBucket::Blocked,
        label: "Blocked",
        matches: is_blocked,
    },
    TriageRule {
        bucket: TriageBucket::ApprovalNeeded,
        label: "Approval needed",
        matches: needs_approval,
    },
    TriageRule {
        bucket: TriageBucket::LeadReview,
        label: "Lead review",
        matches: ready_for_lead,
    },
];

/// First matching bucket for a review-column task; `None` for tasks in
/// other columns.
pub fn triage_bucket(task: &Task) -> Option<TriageBucket> {
    if KanbanColumn::of(task) != KanbanColumn::Review {
        return None;
    }
    TRIAGE_RULES
        .iter()
        .find(|rule| (rule.matches)(task))
        .map(|rule| rule.bucket)
}

/// Display label for a bucket.
pub fn label(bucket: TriageBucket) -> &'static str {
    TRIAGE_RULES
        .iter()
        .find(|rule| rule.bucket == bucket)
        .map_or("All", |rule| rule.label)
}
