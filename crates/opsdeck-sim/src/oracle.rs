use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use opsdeck_core::model::item::ItemId;
use opsdeck_core::query::QueryEntry;

use crate::workload::{Workload, version_of};

// ── Result types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Violations ────────────────────────────────────────────────────────────────

/// One broken invariant of the merged feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The stream never delivered its final event.
    Stalled { last_seen: Option<String> },
    /// The feed entry is not a success entry.
    NotLoaded,
    DuplicateId { id: ItemId, count: usize },
    /// `items[index]` is newer than `items[index - 1]`.
    OutOfOrder { index: usize, id: ItemId },
    TotalMismatch { expected: u64, actual: Option<u64> },
    MissingItem { id: ItemId },
    UnexpectedItem { id: ItemId },
    StaleVersion { id: ItemId, expected: u64, actual: u64 },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stalled { last_seen } => {
                write!(f, "Stalled: stream stopped at {last_seen:?}")
            }
            Self::NotLoaded => f.write_str("NotLoaded: feed entry is not a success entry"),
            Self::DuplicateId { id, count } => {
                write!(f, "DuplicateId: {id} appears {count} times")
            }
            Self::OutOfOrder { index, id } => {
                write!(f, "OutOfOrder: {id} at {index} is newer than its predecessor")
            }
            Self::TotalMismatch { expected, actual } => {
                write!(f, "TotalMismatch: expected {expected}, found {actual:?}")
            }
            Self::MissingItem { id } => write!(f, "MissingItem: {id} never arrived"),
            Self::UnexpectedItem { id } => write!(f, "UnexpectedItem: {id} was never sent"),
            Self::StaleVersion {
                id,
                expected,
                actual,
            } => write!(f, "StaleVersion: {id} holds v{actual}, latest is v{expected}"),
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks a merged feed against the workload that produced it.
pub struct FeedOracle;

impl FeedOracle {
    /// Run every check; violations accumulate.
    pub fn check_all(entry: &QueryEntry, workload: &Workload) -> OracleResult {
        if !entry.is_success() {
            return OracleResult::from_violations(vec![InvariantViolation::NotLoaded]);
        }
        OracleResult::pass()
            .merge(Self::check_unique_ids(entry))
            .merge(Self::check_order(entry))
            .merge(Self::check_total(entry, workload))
            .merge(Self::check_latest_versions(entry, workload))
    }

    pub fn check_unique_ids(entry: &QueryEntry) -> OracleResult {
        let mut counts: BTreeMap<&ItemId, usize> = BTreeMap::new();
        for item in entry.items() {
            *counts.entry(&item.id).or_default() += 1;
        }
        OracleResult::from_violations(
            counts
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(id, count)| InvariantViolation::DuplicateId {
                    id: id.clone(),
                    count,
                })
                .collect(),
        )
    }

    /// `created_at` must be non-increasing down the list.
    pub fn check_order(entry: &QueryEntry) -> OracleResult {
        let items = entry.items();
        OracleResult::from_violations(
            items
                .windows(2)
                .enumerate()
                .filter(|(_, pair)| pair[1].created_at > pair[0].created_at)
                .map(|(index, pair)| InvariantViolation::OutOfOrder {
                    index: index + 1,
                    id: pair[1].id.clone(),
                })
                .collect(),
        )
    }

    pub fn check_total(entry: &QueryEntry, workload: &Workload) -> OracleResult {
        let expected = workload.initial_total + workload.inserted_ids() as u64;
        if entry.total == Some(expected) {
            return OracleResult::pass();
        }
        OracleResult::from_violations(vec![InvariantViolation::TotalMismatch {
            expected,
            actual: entry.total,
        }])
    }

    pub fn check_latest_versions(entry: &QueryEntry, workload: &Workload) -> OracleResult {
        let latest = workload.latest_versions();
        let held: BTreeMap<&ItemId, u64> = entry
            .items()
            .iter()
            .map(|item| (&item.id, version_of(item)))
            .collect();

        let mut violations = Vec::new();
        for (id, expected) in &latest {
            match held.get(id) {
                None => violations.push(InvariantViolation::MissingItem { id: id.clone() }),
                Some(actual) if actual != expected => {
                    violations.push(InvariantViolation::StaleVersion {
                        id: id.clone(),
                        expected: *expected,
                        actual: *actual,
                    });
                }
                Some(_) => {}
            }
        }
        let sent: BTreeSet<&ItemId> = latest.keys().collect();
        violations.extend(
            held.keys()
                .filter(|id| !sent.contains(*id))
                .map(|id| InvariantViolation::UnexpectedItem { id: (*id).clone() }),
        );
        OracleResult::from_violations(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use opsdeck_core::model::item::Item;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn workload(initial: Vec<Item>) -> Workload {
        let total = initial.len() as u64;
        Workload {
            initial,
            initial_total: total,
            log: Vec::new(),
        }
    }

    fn feed(items: Vec<Item>, total: u64) -> QueryEntry {
        QueryEntry::success(items, Some(total), at(0))
    }

    #[test]
    fn untouched_seed_passes() {
        let items = vec![Item::new("b").created(at(2)), Item::new("a").created(at(1))];
        let result = FeedOracle::check_all(&feed(items.clone(), 2), &workload(items));
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn duplicates_and_disorder_are_reported() {
        let items = vec![
            Item::new("a").created(at(1)),
            Item::new("b").created(at(2)),
            Item::new("a").created(at(1)),
        ];
        let result = FeedOracle::check_all(&feed(items, 3), &workload(Vec::new()));
        assert!(!result.passed);
        assert!(result.violations.contains(&InvariantViolation::DuplicateId {
            id: "a".into(),
            count: 2
        }));
        assert!(result.violations.contains(&InvariantViolation::OutOfOrder {
            index: 1,
            id: "b".into()
        }));
    }

    #[test]
    fn wrong_total_is_reported() {
        let items = vec![Item::new("a").created(at(1))];
        let result = FeedOracle::check_total(&feed(items.clone(), 4), &workload(items));
        assert_eq!(
            result.violations,
            [InvariantViolation::TotalMismatch {
                expected: 1,
                actual: Some(4)
            }]
        );
    }

    #[test]
    fn errored_feed_is_not_loaded() {
        let result = FeedOracle::check_all(&QueryEntry::idle(), &workload(Vec::new()));
        assert_eq!(result.violations, [InvariantViolation::NotLoaded]);
        assert_eq!(
            InvariantViolation::NotLoaded.to_string(),
            "NotLoaded: feed entry is not a success entry"
        );
    }
}
