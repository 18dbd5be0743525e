//! Drag-and-drop transitions against the optimistic mutation cache.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use opsdeck_core::model::item::Item;
use opsdeck_core::mutation::{MutationCache, MutationKind, MutationState};
use opsdeck_core::ports::{ApiResponse, MutationRequest, RequestPort};
use opsdeck_core::query::{QueryCache, QueryEntry, QueryKey};
use opsdeck_core::SyncError;
use opsdeck_triage::{BoardMode, DragController, DropOutcome, KanbanColumn, classify_items};
use serde_json::json;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Records every mutation and answers with a fixed status.
struct CountingRequests {
    status: u16,
    issued: Mutex<Vec<MutationRequest>>,
}

impl CountingRequests {
    fn answering(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            issued: Mutex::new(Vec::new()),
        })
    }

    fn issued(&self) -> Vec<MutationRequest> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestPort for CountingRequests {
    async fn list(&self, _key: &QueryKey) -> anyhow::Result<ApiResponse> {
        Ok(ApiResponse::ok(json!([])))
    }

    async fn mutate(&self, request: &MutationRequest) -> anyhow::Result<ApiResponse> {
        self.issued.lock().unwrap().push(request.clone());
        Ok(ApiResponse {
            status: self.status,
            body: json!({"detail": "Task is blocked", "request_id": "req-9"}),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn board_key() -> QueryKey {
    QueryKey::new("tasks").param("board_id", "b1")
}

fn seeded(port: Arc<CountingRequests>) -> MutationCache {
    let cache = QueryCache::builder(port).build();
    let items = vec![
        Item::new("t-1").with_field("status", "inbox"),
        Item::new("t-2").with_field("status", "review"),
    ];
    cache.set(&board_key(), QueryEntry::success(items, Some(2), Utc::now()));
    MutationCache::new(cache)
}

fn column_ids(mutations: &MutationCache, column: KanbanColumn) -> Vec<String> {
    let entry = mutations.cache().get(&board_key());
    let (classification, rejected) = classify_items(entry.items());
    assert!(rejected.is_empty());
    classification
        .column(column)
        .iter()
        .map(|task| task.id.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbox_to_done_issues_one_status_update() {
    let port = CountingRequests::answering(200);
    let mutations = seeded(port.clone());
    let controller = DragController::for_board(BoardMode::Editable, mutations.clone()).unwrap();

    let outcome = controller.on_drop("t-1", "inbox", KanbanColumn::Done).await.unwrap();

    let DropOutcome::Applied(applied) = outcome else {
        panic!("expected a mutation");
    };
    assert_eq!(applied.state, MutationState::Committed);
    assert!(applied.target_keys.contains(&board_key()));

    let issued = port.issued();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].kind, MutationKind::Update);
    assert_eq!(issued[0].collection, "tasks");
    assert_eq!(issued[0].body.len(), 1);
    assert_eq!(issued[0].body["status"], "done");

    assert_eq!(column_ids(&mutations, KanbanColumn::Done), ["t-1"]);
    assert!(column_ids(&mutations, KanbanColumn::Inbox).is_empty());
}

#[tokio::test]
async fn same_column_drop_issues_nothing() {
    let port = CountingRequests::answering(200);
    let mutations = seeded(port.clone());
    let controller = DragController::for_board(BoardMode::Editable, mutations.clone()).unwrap();

    let outcome = controller.on_drop("t-2", "review", KanbanColumn::Review).await.unwrap();

    assert_eq!(outcome, DropOutcome::NoOp);
    assert!(port.issued().is_empty());
    assert_eq!(column_ids(&mutations, KanbanColumn::Review), ["t-2"]);
}

#[tokio::test]
async fn rejected_drop_returns_the_card() {
    let port = CountingRequests::answering(409);
    let mutations = seeded(port.clone());
    let controller = DragController::for_board(BoardMode::Editable, mutations.clone()).unwrap();

    let err = controller
        .on_drop("t-2", "review", KanbanColumn::Done)
        .await
        .unwrap_err();

    match err {
        SyncError::Server { status, detail, .. } => {
            assert_eq!(status, 409);
            assert_eq!(detail, "Task is blocked");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(port.issued().len(), 1);
    assert_eq!(column_ids(&mutations, KanbanColumn::Review), ["t-2"]);
    assert!(column_ids(&mutations, KanbanColumn::Done).is_empty());
}

#[test]
fn read_only_boards_have_no_controller() {
    let mutations = seeded(CountingRequests::answering(200));
    assert!(DragController::for_board(BoardMode::ReadOnly, mutations).is_none());
}
