#![no_main]

use libfuzzer_sys::fuzz_target;
use opsdeck_triage::snapshot::load_tasks;
use opsdeck_triage::{KanbanColumn, TriageBucket, classify, triage_bucket};

// Any decodable snapshot must partition: every task in one column, every
// review task in `all` plus at most one precedence bucket.
fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice(data) else {
        return;
    };
    let Ok(tasks) = load_tasks(body) else {
        return;
    };

    let classification = classify(&tasks);
    let placed: usize = KanbanColumn::ALL
        .iter()
        .map(|column| classification.column(*column).len())
        .sum();
    assert_eq!(placed, tasks.len());

    let review = classification.column(KanbanColumn::Review);
    assert_eq!(classification.filter(TriageBucket::All).len(), review.len());
    let bucketed: usize = [
        TriageBucket::Blocked,
        TriageBucket::ApprovalNeeded,
        TriageBucket::LeadReview,
    ]
    .iter()
    .map(|bucket| classification.filter(*bucket).len())
    .sum();
    assert_eq!(bucketed, review.len());

    for task in review {
        if task.blocked() {
            assert_eq!(triage_bucket(task), Some(TriageBucket::Blocked));
        }
    }
});
