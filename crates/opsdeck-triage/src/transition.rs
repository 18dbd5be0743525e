//! Drag-initiated status transitions.
//!
//! [`plan_drop`] is the pure rule: a drop onto the column the task already
//! sits in is a no-op, anything else is a single-field status update.
//! [`DragController`] carries the plan out through the optimistic mutation
//! cache. Read-only boards never get a controller, so their cards are not
//! draggable at all.

use opsdeck_core::error::SyncError;
use opsdeck_core::model::collection::Collection;
use opsdeck_core::model::item::ItemId;
use opsdeck_core::mutation::{MutationCache, MutationDescriptor, MutationOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::column::KanbanColumn;

/// A card dropped onto a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropEvent {
    pub task_id: ItemId,
    /// Raw status the card had when the drag started.
    pub source_status: String,
    pub destination: KanbanColumn,
}

impl DropEvent {
    pub fn new(
        task_id: impl Into<ItemId>,
        source_status: impl Into<String>,
        destination: KanbanColumn,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            source_status: source_status.into(),
            destination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum DropPlan {
    NoOp,
    Move {
        task_id: ItemId,
        from: KanbanColumn,
        to: KanbanColumn,
    },
}

impl DropPlan {
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// The status update this plan issues, if any.
    pub fn descriptor(&self, collection: &str) -> Option<MutationDescriptor> {
        match self {
            Self::NoOp => None,
            Self::Move { task_id, to, .. } => {
                let mut fields = Map::new();
                fields.insert("status".to_string(), Value::from(to.as_str()));
                Some(MutationDescriptor::update(collection, task_id.clone(), fields))
            }
        }
    }
}

/// Compare the source and destination columns.
///
/// The comparison is on columns, so a task whose unrecognized status placed
/// it in `inbox` is not rewritten when dropped back onto `inbox`.
pub fn plan_drop(event: &DropEvent) -> DropPlan {
    let from = KanbanColumn::from_status(&event.source_status);
    if from == event.destination {
        return DropPlan::NoOp;
    }
    DropPlan::Move {
        task_id: event.task_id.clone(),
        from,
        to: event.destination,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardMode {
    Editable,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropOutcome {
    NoOp,
    Applied(MutationOutcome),
}

/// Executes drops for one editable board.
#[derive(Debug, Clone)]
pub struct DragController {
    mutations: MutationCache,
    collection: String,
}

impl DragController {
    /// Controller for a board in `mode`; `None` for read-only boards.
    pub fn for_board(mode: BoardMode, mutations: MutationCache) -> Option<Self> {
        match mode {
            BoardMode::Editable => Some(Self {
                mutations,
                collection: Collection::Tasks.into(),
            }),
            BoardMode::ReadOnly => None,
        }
    }

    /// Use a collection other than `tasks` for the status mutation.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Handle a drop: no-op for same-column drops, otherwise one optimistic
    /// status update.
    ///
    /// # Errors
    ///
    /// Returns the mutation error (conflict, signed out, network, or server
    /// rejection such as a blocked task); the card is already back in its
    /// source column when this returns.
    pub async fn on_drop(
        &self,
        task_id: impl Into<ItemId>,
        source_status: &str,
        destination: KanbanColumn,
    ) -> Result<DropOutcome, SyncError> {
        self.execute(DropEvent::new(task_id, source_status, destination))
            .await
    }

    /// [`Self::on_drop`] for an already-built event.
    ///
    /// # Errors
    ///
    /// Same as [`Self::on_drop`].
    #[instrument(skip(self), fields(task = %event.task_id, from = %event.source_status))]
    pub async fn execute(&self, event: DropEvent) -> Result<DropOutcome, SyncError> {
        let destination = event.destination;
        let plan = plan_drop(&event);
        let Some(descriptor) = plan.descriptor(&self.collection) else {
            debug!(%destination, "drop onto current column ignored");
            return Ok(DropOutcome::NoOp);
        };
        let outcome = self.mutations.submit(descriptor).await?;
        info!(%destination, "task moved");
        Ok(DropOutcome::Applied(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_column_is_a_noop() {
        let event = DropEvent::new("t-1", "review", KanbanColumn::Review);
        assert_eq!(plan_drop(&event), DropPlan::NoOp);
        assert!(plan_drop(&event).descriptor("tasks").is_none());
    }

    #[test]
    fn unknown_source_status_compares_as_inbox() {
        let event = DropEvent::new("t-1", "triaged", KanbanColumn::Inbox);
        assert!(plan_drop(&event).is_noop());
    }

    #[test]
    fn move_becomes_a_single_field_status_update() {
        let plan = plan_drop(&DropEvent::new("t-1", "inbox", KanbanColumn::Done));
        assert_eq!(
            plan,
            DropPlan::Move {
                task_id: "t-1".into(),
                from: KanbanColumn::Inbox,
                to: KanbanColumn::Done,
            }
        );
        let descriptor = plan.descriptor("tasks").unwrap();
        assert_eq!(descriptor.body.len(), 1);
        assert_eq!(descriptor.body["status"], "done");
        assert_eq!(descriptor.item_id, ItemId::from("t-1"));
    }
}
