//! `deck drop`: plan and dry-run a drag transition against a snapshot.
//!
//! The snapshot seeds an in-memory query cache; the drop then runs through
//! the real drag controller with a request port that records the mutation
//! instead of sending it.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use opsdeck_core::config::SyncConfig;
use opsdeck_core::model::item::Item;
use opsdeck_core::model::task::Task;
use opsdeck_core::ports::{ApiResponse, MutationRequest, RequestPort};
use opsdeck_core::query::{QueryCache, QueryEntry, QueryKey};
use opsdeck_core::MutationCache;
use opsdeck_triage::snapshot::read_tasks;
use opsdeck_triage::{
    BoardMode, DragController, DropEvent, KanbanColumn, classify_items, plan_drop,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::output::{CliError, OutputMode, pretty_kv, render_error, render_mode};

#[derive(Args, Debug)]
pub struct DropArgs {
    /// Tasks list body (a page envelope or a bare array).
    #[arg(value_name = "TASKS_JSON")]
    pub tasks: PathBuf,

    /// Task being dragged.
    #[arg(value_name = "TASK_ID")]
    pub task_id: String,

    /// Column the card is dropped on.
    #[arg(value_name = "COLUMN")]
    pub column: KanbanColumn,

    /// Treat the board as read-only; drops are refused.
    #[arg(long)]
    pub read_only: bool,
}

/// Accepts every mutation and remembers it.
#[derive(Default)]
struct DryRun {
    issued: Mutex<Vec<MutationRequest>>,
}

impl DryRun {
    fn issued(&self) -> Vec<MutationRequest> {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RequestPort for DryRun {
    async fn list(&self, key: &QueryKey) -> anyhow::Result<ApiResponse> {
        anyhow::bail!("dry run does not read {key}")
    }

    async fn mutate(&self, request: &MutationRequest) -> anyhow::Result<ApiResponse> {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(ApiResponse::ok(Value::Object(request.body.clone())))
    }
}

#[derive(Debug, Serialize)]
struct DropReport {
    task_id: String,
    from: KanbanColumn,
    to: KanbanColumn,
    noop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<MutationRequest>,
    /// Column the card sits in after the drop resolved.
    column_after: KanbanColumn,
}

fn write_text(report: &DropReport, w: &mut dyn Write) -> io::Result<()> {
    match &report.request {
        None => writeln!(w, "no-op"),
        Some(request) => writeln!(
            w,
            "{} {}/{} {}",
            request.kind,
            request.collection,
            request.item_id,
            Value::Object(request.body.clone())
        ),
    }
}

fn write_pretty(report: &DropReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_kv(w, "task", &report.task_id)?;
    pretty_kv(w, "from", report.from.title())?;
    pretty_kv(w, "to", report.to.title())?;
    match &report.request {
        None => pretty_kv(w, "mutation", "none (same column)")?,
        Some(request) => pretty_kv(
            w,
            "mutation",
            format!("{} {} {}", request.kind, request.collection, Value::Object(request.body.clone())),
        )?,
    }
    pretty_kv(w, "now in", report.column_after.title())
}

fn board_key() -> QueryKey {
    QueryKey::new("tasks").param("board", "snapshot")
}

fn seed_cache(tasks: &[Task], port: Arc<DryRun>, config: &SyncConfig) -> Result<QueryCache> {
    let cache = QueryCache::builder(port).config(config).build();
    let items = tasks
        .iter()
        .map(|task| serde_json::to_value(task).and_then(Item::from_value))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to convert tasks into cache items")?;
    let total = items.len() as u64;
    cache.set(&board_key(), QueryEntry::success(items, Some(total), cache.now()));
    Ok(cache)
}

fn column_of(cache: &QueryCache, task_id: &str) -> Option<KanbanColumn> {
    let entry = cache.get(&board_key());
    let (classification, _) = classify_items(entry.items());
    KanbanColumn::ALL.into_iter().find(|column| {
        classification
            .column(*column)
            .iter()
            .any(|task| task.id.to_string() == task_id)
    })
}

/// # Errors
///
/// Returns an error when the snapshot cannot be read, the task is missing,
/// the board is read-only, or the mutation fails.
pub fn run_drop(args: &DropArgs, config: &SyncConfig, output: OutputMode) -> Result<()> {
    let tasks = read_tasks(&args.tasks)?;
    let Some(task) = tasks.iter().find(|task| task.id.to_string() == args.task_id) else {
        render_error(
            output,
            &CliError::with_details(
                format!("task '{}' is not on this board", args.task_id),
                "check the id with `deck board <TASKS_JSON>`",
                "task_not_found",
            ),
        )?;
        anyhow::bail!("task not found: {}", args.task_id);
    };

    let event = DropEvent::new(args.task_id.as_str(), task.status.as_str(), args.column);
    let plan = plan_drop(&event);
    let from = KanbanColumn::of(task);
    debug!(?plan, "drop planned");

    let port = Arc::new(DryRun::default());
    let cache = seed_cache(&tasks, port.clone(), config)?;
    let mode = if args.read_only {
        BoardMode::ReadOnly
    } else {
        BoardMode::Editable
    };
    let Some(controller) = DragController::for_board(mode, MutationCache::new(cache.clone())) else {
        render_error(
            output,
            &CliError::with_details(
                "board is read-only",
                "drop --read-only to plan against an editable board",
                "read_only_board",
            ),
        )?;
        anyhow::bail!("board is read-only");
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to build runtime")?;
    let outcome = runtime.block_on(controller.execute(event));
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            render_error(output, &CliError::from(&err))?;
            return Err(err.into());
        }
    };
    debug!(?outcome, "drop resolved");

    let report = DropReport {
        task_id: args.task_id.clone(),
        from,
        to: args.column,
        noop: plan.is_noop(),
        request: port.issued().into_iter().next(),
        column_after: column_of(&cache, &args.task_id).unwrap_or(from),
    };
    render_mode(output, &report, write_text, write_pretty)
}
