//! `deck board`: classify a task snapshot into columns and triage buckets.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use opsdeck_core::model::task::Task;
use opsdeck_triage::rules::label;
use opsdeck_triage::snapshot::read_tasks;
use opsdeck_triage::{KanbanColumn, TriageBucket, classify};
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct BoardArgs {
    /// Tasks list body (a page envelope or a bare array).
    #[arg(value_name = "TASKS_JSON")]
    pub tasks: PathBuf,

    /// Show only review-column tasks in this triage bucket.
    #[arg(long, value_name = "BUCKET")]
    pub filter: Option<TriageBucket>,
}

#[derive(Debug, Serialize)]
struct TaskRow {
    id: String,
    title: String,
    status: String,
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            title: task.title.clone(),
            status: task.status.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ColumnReport {
    column: KanbanColumn,
    title: &'static str,
    count: usize,
    tasks: Vec<TaskRow>,
}

#[derive(Debug, Serialize)]
struct BucketReport {
    bucket: TriageBucket,
    label: &'static str,
    count: usize,
}

#[derive(Debug, Serialize)]
struct FilterReport {
    bucket: TriageBucket,
    tasks: Vec<TaskRow>,
}

#[derive(Debug, Serialize)]
struct BoardReport {
    columns: Vec<ColumnReport>,
    triage: Vec<BucketReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<FilterReport>,
}

fn build_report(tasks: &[Task], filter: Option<TriageBucket>) -> BoardReport {
    let classification = classify(tasks);
    let columns = KanbanColumn::ALL
        .iter()
        .map(|column| {
            let tasks = classification.column(*column);
            ColumnReport {
                column: *column,
                title: column.title(),
                count: tasks.len(),
                tasks: tasks.iter().map(TaskRow::from).collect(),
            }
        })
        .collect();
    let triage = TriageBucket::FILTERS
        .iter()
        .map(|bucket| BucketReport {
            bucket: *bucket,
            label: label(*bucket),
            count: classification.filter(*bucket).len(),
        })
        .collect();
    let filter = filter.map(|bucket| FilterReport {
        bucket,
        tasks: classification
            .filter(bucket)
            .iter()
            .map(TaskRow::from)
            .collect(),
    });
    BoardReport {
        columns,
        triage,
        filter,
    }
}

fn write_text(report: &BoardReport, w: &mut dyn Write) -> io::Result<()> {
    if let Some(filter) = &report.filter {
        for task in &filter.tasks {
            writeln!(w, "{}\t{}\t{}", task.id, task.status, task.title)?;
        }
        return Ok(());
    }
    for column in &report.columns {
        let ids: Vec<&str> = column.tasks.iter().map(|task| task.id.as_str()).collect();
        writeln!(w, "{}\t{}\t{}", column.column, column.count, ids.join(","))?;
    }
    for bucket in &report.triage {
        writeln!(w, "review:{}\t{}", bucket.bucket, bucket.count)?;
    }
    Ok(())
}

fn write_pretty(report: &BoardReport, w: &mut dyn Write) -> io::Result<()> {
    if let Some(filter) = &report.filter {
        pretty_section(w, &format!("Review · {}", label(filter.bucket)))?;
        if filter.tasks.is_empty() {
            writeln!(w, "(no tasks)")?;
        }
        for task in &filter.tasks {
            writeln!(w, "  {:<12} {}", task.id, task.title)?;
        }
        return Ok(());
    }
    for column in &report.columns {
        pretty_section(w, &format!("{} ({})", column.title, column.count))?;
        for task in &column.tasks {
            writeln!(w, "  {:<12} {}", task.id, task.title)?;
        }
        writeln!(w)?;
    }
    pretty_section(w, "Review filters")?;
    for bucket in &report.triage {
        pretty_kv(w, bucket.label, bucket.count.to_string())?;
    }
    Ok(())
}

/// # Errors
///
/// Returns an error when the snapshot cannot be read or decoded.
pub fn run_board(args: &BoardArgs, output: OutputMode) -> Result<()> {
    let tasks = read_tasks(&args.tasks)?;
    let report = build_report(&tasks, args.filter);
    render_mode(output, &report, write_text, write_pretty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: &str, blocked: bool) -> Task {
        let mut task = Task::new(id, status);
        task.is_blocked = blocked;
        task
    }

    #[test]
    fn report_lists_every_column_and_filter() {
        let report = build_report(&[task("a", "review", true), task("b", "done", false)], None);
        assert_eq!(report.columns.len(), 4);
        assert_eq!(report.triage.len(), 4);
        assert_eq!(report.triage[1].bucket, TriageBucket::Blocked);
        assert_eq!(report.triage[1].count, 1);
        assert!(report.filter.is_none());
    }

    #[test]
    fn text_output_for_a_filter_lists_only_matches() {
        let report = build_report(
            &[task("a", "review", true), task("b", "review", false)],
            Some(TriageBucket::Blocked),
        );
        let mut buf = Vec::new();
        write_text(&report, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("a\treview"));
    }
}
