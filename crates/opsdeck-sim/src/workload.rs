//! Generated activity logs.
//!
//! A workload is a seeded first page plus the event log the server would
//! stream after it. Events either insert a new item (usually the newest,
//! sometimes backfilled with an older timestamp) or publish a new version of
//! an item already known, keeping its `created_at`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use opsdeck_core::model::item::{Item, ItemId};
use opsdeck_core::ports::StreamFrame;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::rng::DeterministicRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Items on the seeded first page.
    pub initial_items: usize,
    /// Items the server reports beyond the first page.
    pub hidden_items: u64,
    /// Events streamed after the page was read.
    pub events: usize,
    /// Percentage of events that re-publish a known item.
    pub update_percent: u8,
    /// Percentage of inserts stamped earlier than the newest item.
    pub backfill_percent: u8,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            initial_items: 8,
            hidden_items: 40,
            events: 60,
            update_percent: 25,
            backfill_percent: 10,
        }
    }
}

/// Seeded page plus the stream that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub initial: Vec<Item>,
    pub initial_total: u64,
    pub log: Vec<StreamFrame>,
}

/// Wall-clock origin of every simulated run.
pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000, 0)
        .single()
        .unwrap_or_default()
}

fn payload(id: &str, created_at: DateTime<Utc>, version: u64) -> Value {
    json!({
        "id": id,
        "created_at": created_at.to_rfc3339(),
        "version": version,
        "message": format!("{id} v{version}"),
    })
}

impl Workload {
    pub fn generate(config: &WorkloadConfig, rng: &mut DeterministicRng) -> Self {
        let base = epoch();
        let mut known: Vec<(String, DateTime<Utc>, u64)> = Vec::new();

        // Page is newest first.
        let mut initial = Vec::with_capacity(config.initial_items);
        for n in (0..config.initial_items).rev() {
            let id = format!("seed-{n}");
            let at = base + Duration::seconds(i64::try_from(n).unwrap_or(0) * 10);
            initial.push(Item::new(id.as_str()).created(at).with_field("version", 0));
            known.push((id, at, 0));
        }
        let initial_total = config.initial_items as u64 + config.hidden_items;

        let mut newest = base + Duration::seconds(i64::try_from(config.initial_items).unwrap_or(0) * 10);
        let mut log = Vec::with_capacity(config.events);
        for seq in 0..config.events {
            let event_id = format!("evt-{seq:05}");
            let frame_payload = if !known.is_empty() && rng.chance(config.update_percent) {
                let slot = rng.index(known.len());
                let (id, at, version) = &mut known[slot];
                *version += 1;
                payload(id, *at, *version)
            } else {
                let id = format!("new-{seq}");
                let at = if rng.chance(config.backfill_percent) {
                    let back = i64::try_from(rng.below(600)).unwrap_or(0);
                    newest - Duration::seconds(back)
                } else {
                    newest += Duration::seconds(i64::try_from(rng.below(5)).unwrap_or(0));
                    newest
                };
                known.push((id.clone(), at, 1));
                payload(&id, at, 1)
            };
            log.push(StreamFrame {
                event_id,
                payload: frame_payload,
            });
        }

        Self {
            initial,
            initial_total,
            log,
        }
    }

    /// Version each item should end at, by id.
    pub fn latest_versions(&self) -> BTreeMap<ItemId, u64> {
        let mut latest: BTreeMap<ItemId, u64> = self
            .initial
            .iter()
            .map(|item| (item.id.clone(), version_of(item)))
            .collect();
        for frame in &self.log {
            if let Ok(item) = Item::from_value(frame.payload.clone()) {
                let version = version_of(&item);
                latest.insert(item.id, version);
            }
        }
        latest
    }

    /// Ids streamed that were not on the seeded page.
    pub fn inserted_ids(&self) -> usize {
        let latest = self.latest_versions();
        latest.len() - self.initial.len()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.log.last().map(|frame| frame.event_id.as_str())
    }
}

pub fn version_of(item: &Item) -> u64 {
    item.field("version").and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let config = WorkloadConfig::default();
        let a = Workload::generate(&config, &mut DeterministicRng::new(11));
        let b = Workload::generate(&config, &mut DeterministicRng::new(11));
        assert_eq!(a, b);
    }

    #[test]
    fn seeded_page_is_newest_first() {
        let workload = Workload::generate(&WorkloadConfig::default(), &mut DeterministicRng::new(2));
        let stamps: Vec<_> = workload.initial.iter().map(|item| item.created_at).collect();
        let mut sorted = stamps.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(stamps, sorted);
        assert_eq!(workload.initial_total, 48);
    }

    #[test]
    fn updates_only_bump_versions() {
        let config = WorkloadConfig {
            update_percent: 100,
            ..WorkloadConfig::default()
        };
        let workload = Workload::generate(&config, &mut DeterministicRng::new(4));
        assert_eq!(workload.inserted_ids(), 0);
        let total: u64 = workload.latest_versions().values().sum();
        assert_eq!(total, config.events as u64);
    }
}
