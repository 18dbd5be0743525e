//! Loading board snapshots from JSON.
//!
//! Accepts whatever a tasks list endpoint returns: the paginated envelope or
//! a bare array.

use std::path::Path;

use anyhow::{Context, Result};
use opsdeck_core::model::page::Page;
use opsdeck_core::model::task::Task;
use serde_json::Value;

/// Decode every task in a list body.
///
/// # Errors
///
/// Fails when the body is not a list response or an entry is not a task.
pub fn load_tasks(body: Value) -> Result<Vec<Task>> {
    let page = Page::from_body(body).context("body is neither a page nor an array")?;
    page.items
        .iter()
        .map(|item| Task::from_item(item).with_context(|| format!("item {} is not a task", item.id)))
        .collect()
}

/// [`load_tasks`] on a file.
///
/// # Errors
///
/// Fails when the file cannot be read or does not decode.
pub fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let body: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not JSON", path.display()))?;
    load_tasks(body)
}
