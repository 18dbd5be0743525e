use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorInfo, SyncError};
use crate::model::item::{Item, ItemId};
use crate::model::page::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known state of one query key.
///
/// `data` is `Some` only while `status` is [`QueryStatus::Success`]. Its
/// order is the server's order (or the stream merge order); the cache never
/// re-sorts it. Construct entries through the associated functions to keep
/// that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub status: QueryStatus,
    pub data: Option<Vec<Item>>,
    pub total: Option<u64>,
    pub error: Option<ErrorInfo>,
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Set by invalidation; cleared by the next successful read.
    #[serde(default)]
    pub stale: bool,
}

impl Default for QueryEntry {
    fn default() -> Self {
        Self::idle()
    }
}

impl QueryEntry {
    /// The entry returned for keys that were never loaded.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            total: None,
            error: None,
            last_updated_at: None,
            stale: false,
        }
    }

    #[must_use]
    pub const fn loading() -> Self {
        Self {
            status: QueryStatus::Loading,
            data: None,
            total: None,
            error: None,
            last_updated_at: None,
            stale: false,
        }
    }

    pub const fn success(data: Vec<Item>, total: Option<u64>, at: DateTime<Utc>) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            total,
            error: None,
            last_updated_at: Some(at),
            stale: false,
        }
    }

    pub fn from_page(page: Page, at: DateTime<Utc>) -> Self {
        Self::success(page.items, page.total, at)
    }

    pub fn failed(err: &SyncError, at: DateTime<Utc>) -> Self {
        Self {
            status: QueryStatus::Error,
            data: None,
            total: None,
            error: Some(ErrorInfo::from(err)),
            last_updated_at: Some(at),
            stale: false,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub fn items(&self) -> &[Item] {
        self.data.as_deref().unwrap_or_default()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items().iter().any(|item| &item.id == id)
    }

    pub fn position(&self, id: &ItemId) -> Option<usize> {
        self.items().iter().position(|item| &item.id == id)
    }

    /// Whether the entry should be re-read before it is shown to a new
    /// subscriber.
    pub fn needs_fetch(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.status {
            QueryStatus::Idle | QueryStatus::Error => true,
            QueryStatus::Loading => false,
            QueryStatus::Success => {
                self.stale
                    || self
                        .last_updated_at
                        .is_none_or(|at| now.signed_duration_since(at) > stale_after)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn only_success_carries_data() {
        assert!(QueryEntry::idle().data.is_none());
        assert!(QueryEntry::loading().data.is_none());
        assert_eq!(QueryEntry::loading().status, QueryStatus::Loading);
        assert!(!QueryEntry::loading().stale);
        assert!(QueryEntry::failed(&SyncError::network("down"), at(0)).data.is_none());
        let ok = QueryEntry::success(vec![Item::new("a")], Some(1), at(0));
        assert!(ok.is_success());
        assert_eq!(ok.items().len(), 1);
    }

    #[test]
    fn freshness_rules() {
        let window = chrono::Duration::seconds(30);
        let fresh = QueryEntry::success(vec![], Some(0), at(0));
        assert!(!fresh.needs_fetch(at(10), window));
        assert!(fresh.needs_fetch(at(31), window));

        let mut stale = fresh.clone();
        stale.stale = true;
        assert!(stale.needs_fetch(at(1), window));

        assert!(QueryEntry::idle().needs_fetch(at(0), window));
        assert!(!QueryEntry::loading().needs_fetch(at(0), window));
    }

    #[test]
    fn position_finds_items_by_id() {
        let entry = QueryEntry::success(
            vec![Item::new("a"), Item::new(7)],
            Some(2),
            at(0),
        );
        assert_eq!(entry.position(&ItemId::Int(7)), Some(1));
        assert!(!entry.contains(&ItemId::from("zz")));
    }
}
