//! Merge rule for pushed items.
//!
//! Lists are newest first. A pushed item whose id is already cached replaces
//! that entry where it stands; anything else is inserted ahead of the first
//! entry that is not newer than it, so among equal `created_at` values the
//! latest arrival comes first.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::model::item::Item;
use crate::query::entry::QueryEntry;

/// How a merged insert affects the entry's `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalPolicy {
    /// `total` counts genuine inserts.
    #[default]
    CountInserts,
    /// `total` belongs to the read path and is left alone.
    Untracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    Replaced { index: usize },
    /// The entry holds no data to merge into.
    Skipped,
}

impl MergeOutcome {
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

/// Merge one pushed item into `entry`.
pub fn merge_item(entry: &mut QueryEntry, item: Item, policy: TotalPolicy) -> MergeOutcome {
    if !entry.is_success() {
        return MergeOutcome::Skipped;
    }
    let Some(data) = entry.data.as_mut() else {
        return MergeOutcome::Skipped;
    };

    if let Some(index) = data.iter().position(|existing| existing.id == item.id) {
        data[index] = item;
        return MergeOutcome::Replaced { index };
    }

    let index = insertion_index(data, &item);
    data.insert(index, item);
    if policy == TotalPolicy::CountInserts {
        entry.total = Some(entry.total.map_or(1, |total| total.saturating_add(1)));
    }
    MergeOutcome::Inserted { index }
}

fn insertion_index(data: &[Item], item: &Item) -> usize {
    let Some(created) = item.created_at else {
        return 0;
    };
    data.iter()
        .position(|existing| existing.created_at.is_none_or(|at| at <= created))
        .unwrap_or(data.len())
}

/// Bounded memory of recently delivered event ids.
#[derive(Debug, Clone, Default)]
pub struct EventWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl EventWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
        }
    }

    /// Record `event_id`; returns `false` when it was already in the window.
    pub fn admit(&mut self, event_id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(event_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(event_id.to_string());
        self.seen.insert(event_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn feed(items: &[(&str, i64)]) -> QueryEntry {
        let data = items
            .iter()
            .map(|(id, secs)| Item::new(*id).created(at(*secs)))
            .collect::<Vec<_>>();
        let total = data.len() as u64;
        QueryEntry::success(data, Some(total), at(0))
    }

    fn ids(entry: &QueryEntry) -> Vec<String> {
        entry.items().iter().map(|item| item.id.to_string()).collect()
    }

    #[test]
    fn newer_items_go_first() {
        let mut entry = feed(&[("b", 20), ("a", 10)]);
        let outcome = merge_item(&mut entry, Item::new("c").created(at(30)), TotalPolicy::CountInserts);
        assert_eq!(outcome, MergeOutcome::Inserted { index: 0 });
        assert_eq!(ids(&entry), ["c", "b", "a"]);
        assert_eq!(entry.total, Some(3));
    }

    #[test]
    fn older_items_slot_into_place() {
        let mut entry = feed(&[("c", 30), ("a", 10)]);
        merge_item(&mut entry, Item::new("b").created(at(20)), TotalPolicy::CountInserts);
        assert_eq!(ids(&entry), ["c", "b", "a"]);
        merge_item(&mut entry, Item::new("z").created(at(1)), TotalPolicy::CountInserts);
        assert_eq!(ids(&entry), ["c", "b", "a", "z"]);
    }

    #[test]
    fn ties_favour_the_later_arrival() {
        let mut entry = feed(&[("first", 10)]);
        merge_item(&mut entry, Item::new("second").created(at(10)), TotalPolicy::CountInserts);
        assert_eq!(ids(&entry), ["second", "first"]);
    }

    #[test]
    fn same_id_replaces_in_place_without_counting() {
        let mut entry = feed(&[("b", 20), ("a", 10)]);
        let update = Item::new("a").created(at(99)).with_field("message", "edited");
        let outcome = merge_item(&mut entry, update, TotalPolicy::CountInserts);
        assert_eq!(outcome, MergeOutcome::Replaced { index: 1 });
        assert_eq!(ids(&entry), ["b", "a"]);
        assert_eq!(entry.items()[1].str_field("message"), Some("edited"));
        assert_eq!(entry.total, Some(2));
    }

    #[test]
    fn untracked_total_is_left_alone() {
        let mut entry = feed(&[("a", 10)]);
        merge_item(&mut entry, Item::new("b").created(at(20)), TotalPolicy::Untracked);
        assert_eq!(entry.total, Some(1));
        assert_eq!(entry.items().len(), 2);
    }

    #[test]
    fn entries_without_data_are_skipped() {
        let mut entry = QueryEntry::loading();
        let outcome = merge_item(&mut entry, Item::new("a"), TotalPolicy::CountInserts);
        assert_eq!(outcome, MergeOutcome::Skipped);
        assert_eq!(entry, QueryEntry::loading());
    }

    #[test]
    fn window_forgets_oldest_ids() {
        let mut window = EventWindow::new(2);
        assert!(window.admit("1"));
        assert!(!window.admit("1"));
        assert!(window.admit("2"));
        assert!(window.admit("3"));
        assert_eq!(window.len(), 2);
        assert!(window.admit("1"));
    }

    #[test]
    fn zero_capacity_window_admits_everything() {
        let mut window = EventWindow::new(0);
        assert!(window.admit("1"));
        assert!(window.admit("1"));
        assert!(window.is_empty());
    }

    proptest! {
        #[test]
        fn redelivery_is_idempotent(
            stamps in proptest::collection::vec(0i64..50, 1..20),
            pick in any::<prop::sample::Index>(),
        ) {
            let mut entry = QueryEntry::success(vec![], Some(0), at(0));
            let items: Vec<Item> = stamps
                .iter()
                .enumerate()
                .map(|(i, secs)| Item::new(i as i64).created(at(*secs)))
                .collect();
            for item in &items {
                merge_item(&mut entry, item.clone(), TotalPolicy::CountInserts);
            }
            let once = entry.clone();

            let again = pick.get(&items).clone();
            let outcome = merge_item(&mut entry, again, TotalPolicy::CountInserts);
            let replaced = matches!(outcome, MergeOutcome::Replaced { index: _ });
            prop_assert!(replaced, "second delivery should replace in place, got {:?}", outcome);
            prop_assert_eq!(&entry, &once);
            prop_assert_eq!(entry.total, Some(items.len() as u64));
        }

        #[test]
        fn merged_feed_stays_sorted_newest_first(
            stamps in proptest::collection::vec(0i64..1_000, 0..40),
        ) {
            let mut entry = QueryEntry::success(vec![], Some(0), at(0));
            for (i, secs) in stamps.iter().enumerate() {
                merge_item(&mut entry, Item::new(i as i64).created(at(*secs)), TotalPolicy::CountInserts);
            }
            let created: Vec<_> = entry.items().iter().map(|item| item.created_at).collect();
            prop_assert!(created.windows(2).all(|pair| pair[0] >= pair[1]));
        }
    }
}
