#![forbid(unsafe_code)]
//! opsdeck-triage library.
//!
//! Pure classification of tasks into kanban columns and review-column triage
//! buckets, plus the drag-and-drop transition that turns a column change into
//! an optimistic status update.
//!
//! # Conventions
//!
//! - **Errors**: Drag transitions return [`opsdeck_core::SyncError`];
//!   snapshot loading uses `anyhow::Result`.
//! - **Logging**: Use `tracing` macros (`info!`, `debug!`).

pub mod classify;
pub mod column;
pub mod rules;
pub mod snapshot;
pub mod transition;

pub use classify::{BucketCounts, Classification, classify, classify_items};
pub use column::KanbanColumn;
pub use rules::{TRIAGE_RULES, TriageBucket, TriageRule, triage_bucket};
pub use transition::{BoardMode, DragController, DropEvent, DropOutcome, DropPlan, plan_drop};
