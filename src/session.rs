//! Notebook session capabilities on the host side.
//!
//! `NotebookSession` is the seam between the command handlers and whatever
//! actually holds the document. Execution is event-driven underneath, so
//! `execute_cell` hands back a one-shot receiver that fires when the cell's
//! outputs have settled rather than blocking the caller.
//!
//! `InMemoryNotebook` is a self-contained implementation backed by a
//! pluggable `CellExecutor`. It is what the `host` CLI subcommand and the
//! tests run against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::output::OutputItem;
use crate::protocol::CellType;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no cell with id {0}")]
    UnknownCell(String),

    #[error("could not save notebook: {0}")]
    Save(String),

    #[error("{0}")]
    Other(String),
}

/// One cell of the document, as seen by the handlers.
#[derive(Debug, Clone)]
pub struct CellRecord {
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
    pub execution_count: Option<u64>,
    pub outputs: Vec<OutputItem>,
}

/// Document-level metadata reported to controllers.
#[derive(Debug, Clone)]
pub struct NotebookDescription {
    pub name: String,
    pub path: PathBuf,
    pub kernel_name: String,
    pub unsaved_changes: bool,
    pub trusted: bool,
}

/// What the command handlers need from a notebook.
///
/// Implementations clamp out-of-range insert positions to the end of the
/// document; only indexed lookups reject bad indices.
pub trait NotebookSession: Send + Sync + 'static {
    /// Insert a cell and return its id.
    fn insert_cell(
        &self,
        position: usize,
        cell_type: CellType,
        source: &str,
    ) -> Result<String, SessionError>;

    /// Start executing the cell with the given id. Ids stay stable while
    /// concurrent inserts shift positions, so the caller always runs the
    /// cell it selected. The returned receiver fires once the cell's
    /// outputs have been applied; a dropped sender means the execution was
    /// abandoned.
    fn execute_cell(&self, cell_id: &str) -> Result<oneshot::Receiver<()>, SessionError>;

    /// Reset execution state and re-run every cell from the top. Returns as
    /// soon as the run has been started.
    fn restart_and_run_all(&self) -> Result<(), SessionError>;

    /// Persist the document and return the path written.
    fn save(&self) -> Result<PathBuf, SessionError>;

    /// Snapshot of the current cells in document order.
    fn cells(&self) -> Vec<CellRecord>;

    fn describe(&self) -> NotebookDescription;
}

/// Result of handing a source string to a `CellExecutor`.
pub enum Execution {
    /// Outputs were produced synchronously.
    Completed(Vec<OutputItem>),
    /// Outputs will arrive later; a dropped sender abandons the execution.
    Pending(oneshot::Receiver<Vec<OutputItem>>),
}

/// Produces outputs for code cells. Markdown and raw cells never reach it.
pub trait CellExecutor: Send + Sync + 'static {
    fn execute(&self, source: &str) -> Execution;
}

/// Echoes the cell source back as a single stream output.
#[derive(Debug, Default)]
pub struct EchoExecutor;

impl CellExecutor for EchoExecutor {
    fn execute(&self, source: &str) -> Execution {
        Execution::Completed(vec![OutputItem::stream(source)])
    }
}

/// Maps exact source strings to canned outputs; unknown sources produce
/// nothing. Built once up front so it can be shared across threads.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: HashMap<String, Vec<OutputItem>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, source: &str, outputs: Vec<OutputItem>) -> Self {
        self.responses.insert(source.to_string(), outputs);
        self
    }
}

impl CellExecutor for ScriptedExecutor {
    fn execute(&self, source: &str) -> Execution {
        Execution::Completed(self.responses.get(source).cloned().unwrap_or_default())
    }
}

struct NotebookState {
    name: String,
    path: PathBuf,
    kernel_name: String,
    cells: Vec<CellRecord>,
    execution_counter: u64,
    dirty: bool,
    trusted: bool,
}

/// A notebook held entirely in memory, executed by a pluggable executor,
/// and saved as nbformat 4 JSON.
#[derive(Clone)]
pub struct InMemoryNotebook {
    state: Arc<Mutex<NotebookState>>,
    executor: Arc<dyn CellExecutor>,
}

impl InMemoryNotebook {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        kernel_name: impl Into<String>,
        executor: Arc<dyn CellExecutor>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(NotebookState {
                name: name.into(),
                path: path.into(),
                kernel_name: kernel_name.into(),
                cells: Vec::new(),
                execution_counter: 0,
                dirty: false,
                trusted: true,
            })),
            executor,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NotebookState>, SessionError> {
        self.state
            .lock()
            .map_err(|_| SessionError::Other("notebook state poisoned".to_string()))
    }

    /// Apply finished outputs to the cell that started the execution. The
    /// cell is looked up by id because it may have moved since.
    fn apply_outputs(&self, cell_id: &str, outputs: Vec<OutputItem>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.execution_counter += 1;
        let count = state.execution_counter;
        let Some(cell) = state.cells.iter_mut().find(|c| c.id == cell_id) else {
            warn!("[session] outputs arrived for a removed cell {}", cell_id);
            return;
        };
        cell.outputs = outputs;
        cell.execution_count = Some(count);
        state.dirty = true;
    }

    /// Run the executor for the cell with the given id and return the
    /// completion receiver. Non-code cells complete immediately without
    /// outputs.
    fn start_execution(&self, cell_id: &str) -> Result<oneshot::Receiver<()>, SessionError> {
        let (cell_id, cell_type, source) = {
            let mut state = self.lock()?;
            let cell = state
                .cells
                .iter_mut()
                .find(|c| c.id == cell_id)
                .ok_or_else(|| SessionError::UnknownCell(cell_id.to_string()))?;
            if cell.cell_type == CellType::Code {
                cell.outputs.clear();
                cell.execution_count = None;
            }
            (cell.id.clone(), cell.cell_type, cell.source.clone())
        };

        let (done_tx, done_rx) = oneshot::channel();
        if cell_type != CellType::Code {
            let _ = done_tx.send(());
            return Ok(done_rx);
        }

        match self.executor.execute(&source) {
            Execution::Completed(outputs) => {
                self.apply_outputs(&cell_id, outputs);
                let _ = done_tx.send(());
            }
            Execution::Pending(out_rx) => {
                let session = self.clone();
                tokio::spawn(async move {
                    match out_rx.await {
                        Ok(outputs) => {
                            session.apply_outputs(&cell_id, outputs);
                            let _ = done_tx.send(());
                        }
                        // Abandoned execution: drop done_tx unsignalled so
                        // the waiter sees it as aborted.
                        Err(_) => debug!("[session] execution abandoned for cell {}", cell_id),
                    }
                });
            }
        }
        Ok(done_rx)
    }
}

impl NotebookSession for InMemoryNotebook {
    fn insert_cell(
        &self,
        position: usize,
        cell_type: CellType,
        source: &str,
    ) -> Result<String, SessionError> {
        let mut state = self.lock()?;
        let position = position.min(state.cells.len());
        let cell = CellRecord {
            id: Uuid::new_v4().to_string(),
            cell_type,
            source: source.to_string(),
            execution_count: None,
            outputs: Vec::new(),
        };
        let id = cell.id.clone();
        state.cells.insert(position, cell);
        state.dirty = true;
        Ok(id)
    }

    fn execute_cell(&self, cell_id: &str) -> Result<oneshot::Receiver<()>, SessionError> {
        self.start_execution(cell_id)
    }

    fn restart_and_run_all(&self) -> Result<(), SessionError> {
        let ids: Vec<String> = {
            let mut state = self.lock()?;
            state.execution_counter = 0;
            for cell in &mut state.cells {
                cell.outputs.clear();
                cell.execution_count = None;
            }
            state.cells.iter().map(|c| c.id.clone()).collect()
        };

        let session = self.clone();
        tokio::spawn(async move {
            for id in ids {
                match session.start_execution(&id) {
                    Ok(done) => {
                        // Cells run in order, each waiting for the previous
                        // one to settle.
                        let _ = done.await;
                    }
                    Err(e) => {
                        warn!("[session] run-all skipped cell {}: {}", id, e);
                    }
                }
            }
        });
        Ok(())
    }

    fn save(&self) -> Result<PathBuf, SessionError> {
        let mut state = self.lock()?;
        let document = render_nbformat(&state);
        let serialized = serde_json::to_vec_pretty(&document)
            .map_err(|e| SessionError::Save(e.to_string()))?;
        std::fs::write(&state.path, serialized)
            .map_err(|e| SessionError::Save(format!("{}: {}", state.path.display(), e)))?;
        state.dirty = false;
        Ok(state.path.clone())
    }

    fn cells(&self) -> Vec<CellRecord> {
        match self.state.lock() {
            Ok(state) => state.cells.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn describe(&self) -> NotebookDescription {
        match self.state.lock() {
            Ok(state) => NotebookDescription {
                name: state.name.clone(),
                path: state.path.clone(),
                kernel_name: state.kernel_name.clone(),
                unsaved_changes: state.dirty,
                trusted: state.trusted,
            },
            Err(_) => NotebookDescription {
                name: String::new(),
                path: PathBuf::new(),
                kernel_name: String::new(),
                unsaved_changes: false,
                trusted: false,
            },
        }
    }
}

/// Serialize the document as nbformat 4.5 JSON.
fn render_nbformat(state: &NotebookState) -> serde_json::Value {
    let cells: Vec<serde_json::Value> = state.cells.iter().map(render_cell).collect();
    json!({
        "cells": cells,
        "metadata": {
            "kernelspec": {
                "name": state.kernel_name,
                "display_name": state.kernel_name,
            },
        },
        "nbformat": 4,
        "nbformat_minor": 5,
    })
}

fn render_cell(cell: &CellRecord) -> serde_json::Value {
    let cell_type = match cell.cell_type {
        CellType::Code => "code",
        CellType::Markdown => "markdown",
        CellType::Raw => "raw",
    };
    let mut value = json!({
        "id": cell.id,
        "cell_type": cell_type,
        "metadata": {},
        "source": cell.source,
    });
    if cell.cell_type == CellType::Code {
        value["execution_count"] = match cell.execution_count {
            Some(n) => json!(n),
            None => serde_json::Value::Null,
        };
        value["outputs"] = json!(cell
            .outputs
            .iter()
            .map(render_output)
            .collect::<Vec<serde_json::Value>>());
    }
    value
}

fn render_output(output: &OutputItem) -> serde_json::Value {
    if let Some(text) = &output.text {
        json!({
            "output_type": "stream",
            "name": "stdout",
            "text": text,
        })
    } else {
        json!({
            "output_type": "display_data",
            "data": output.data,
            "metadata": {},
        })
    }
}

/// Filename stem, used as the notebook's display name.
pub fn notebook_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string())
}
