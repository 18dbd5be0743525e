use std::collections::BTreeMap;

use opsdeck_core::model::item::Item;
use opsdeck_core::model::task::Task;
use serde::Serialize;
use tracing::debug;

use crate::column::KanbanColumn;
use crate::rules::{TriageBucket, triage_bucket};

/// Derived view state for one board.
///
/// Every bucket keeps the input order of the tasks it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub by_column: BTreeMap<KanbanColumn, Vec<Task>>,
    pub by_triage_bucket: BTreeMap<TriageBucket, Vec<Task>>,
}

/// Badge counts for the columns and the review filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketCounts {
    pub columns: BTreeMap<KanbanColumn, usize>,
    pub triage: BTreeMap<TriageBucket, usize>,
}

impl Classification {
    pub fn column(&self, column: KanbanColumn) -> &[Task] {
        self.by_column.get(&column).map(Vec::as_slice).unwrap_or_default()
    }

    /// Review-column tasks shown under `bucket`.
    pub fn filter(&self, bucket: TriageBucket) -> &[Task] {
        self.by_triage_bucket.get(&bucket).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            columns: self
                .by_column
                .iter()
                .map(|(column, tasks)| (*column, tasks.len()))
                .collect(),
            triage: self
                .by_triage_bucket
                .iter()
                .map(|(bucket, tasks)| (*bucket, tasks.len()))
                .collect(),
        }
    }
}

/// Assign every task to its column and every review task to its triage
/// bucket. All buckets are present, possibly empty.
pub fn classify(tasks: &[Task]) -> Classification {
    let mut by_column: BTreeMap<KanbanColumn, Vec<Task>> =
        KanbanColumn::ALL.iter().map(|c| (*c, Vec::new())).collect();
    let mut by_triage_bucket: BTreeMap<TriageBucket, Vec<Task>> =
        TriageBucket::FILTERS.iter().map(|b| (*b, Vec::new())).collect();

    for task in tasks {
        let column = KanbanColumn::of(task);
        by_column.entry(column).or_default().push(task.clone());
        if column != KanbanColumn::Review {
            continue;
        }
        by_triage_bucket
            .entry(TriageBucket::All)
            .or_default()
            .push(task.clone());
        if let Some(bucket) = triage_bucket(task) {
            by_triage_bucket.entry(bucket).or_default().push(task.clone());
        }
    }

    Classification {
        by_column,
        by_triage_bucket,
    }
}

/// Classify cached items. Items that do not decode as tasks are skipped
/// and returned alongside.
pub fn classify_items(items: &[Item]) -> (Classification, Vec<Item>) {
    let mut tasks = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for item in items {
        match Task::from_item(item) {
            Ok(task) => tasks.push(task),
            Err(err) => {
                debug!(id = %item.id, error = %err, "item is not a task");
                rejected.push(item.clone());
            }
        }
    }
    (classify(&tasks), rejected)
}
