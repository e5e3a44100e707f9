//! Wire protocol for the notebook relay.
//!
//! Command and Response envelopes are serialized as JSON and sent over
//! length-prefixed frames (see `framing.rs`). Envelopes are tagged by `type`
//! and correlated by `request_id`: the controller generates a unique id per
//! command, the host echoes it on exactly one response.
//!
//! The relay itself never needs the typed envelopes; it forwards raw JSON
//! and only peeks at `request_id`, so a host and controller can evolve
//! fields without the relay caring. The typed enums here are what the host
//! endpoint dispatches on and what the controller client builds and parses.

use serde::{Deserialize, Serialize};

use crate::output::DEFAULT_MAX_OUTPUT_LENGTH;

// ─── Role negotiation ────────────────────────────────────────────────────────

/// Role declaration, the first frame on every connection.
///
/// `{"role": "notebook"}` marks the connection as the host; any other
/// declared role is treated as a controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDeclaration {
    pub role: String,
}

impl RoleDeclaration {
    pub const NOTEBOOK: &'static str = "notebook";
    pub const CONTROLLER: &'static str = "controller";

    /// Role declaration for the host side.
    pub fn notebook() -> Self {
        Self {
            role: Self::NOTEBOOK.to_string(),
        }
    }

    /// Role declaration for a controller.
    pub fn controller() -> Self {
        Self {
            role: Self::CONTROLLER.to_string(),
        }
    }

    pub fn is_notebook(&self) -> bool {
        self.role == Self::NOTEBOOK
    }
}

// ─── Shared enums ────────────────────────────────────────────────────────────

/// Jupyter cell types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Image encodings recognized in cell output mime bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Svg,
}

impl ImageFormat {
    /// Extraction order within one output fragment is fixed: png, jpeg, svg.
    pub const ALL: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Svg];

    /// The mime-bundle key this format is stored under.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Svg => "image/svg+xml",
        }
    }
}

/// One image payload harvested from a cell's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub format: ImageFormat,
    /// Encoded image data as it appeared in the mime bundle (base64 for
    /// raster formats, markup for svg).
    pub data: String,
}

// ─── Commands (controller → host) ────────────────────────────────────────────

fn default_max_length() -> usize {
    DEFAULT_MAX_OUTPUT_LENGTH
}

/// Commands a controller can submit, each carrying its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Insert a cell and, for code cells, execute it before responding.
    InsertAndExecuteCell {
        request_id: String,
        /// Desired position; clamped to the document bounds by the host.
        #[serde(default)]
        position: usize,
        cell_type: CellType,
        content: String,
    },

    /// Checkpoint the notebook to disk.
    SaveNotebook { request_id: String },

    /// List every cell in document order.
    GetCellsInfo { request_id: String },

    /// Describe the notebook (name, path, kernel, flags).
    GetNotebookInfo { request_id: String },

    /// Execute the cell at `index` and respond with its captured output.
    /// `index` is signed so that negative values can be rejected explicitly.
    RunCell { request_id: String, index: i64 },

    /// Restart the kernel and re-execute every cell top to bottom.
    /// Acknowledged once issued; does not wait for completion.
    RunAllCells { request_id: String },

    /// Fetch the captured text output of the cell at `index`.
    GetCellTextOutput {
        request_id: String,
        index: i64,
        #[serde(default = "default_max_length")]
        max_length: usize,
    },

    /// Fetch the image payloads of the cell at `index`.
    GetCellImageOutput { request_id: String, index: i64 },
}

impl Command {
    /// The correlation id the matching response must echo.
    pub fn request_id(&self) -> &str {
        match self {
            Command::InsertAndExecuteCell { request_id, .. }
            | Command::SaveNotebook { request_id }
            | Command::GetCellsInfo { request_id }
            | Command::GetNotebookInfo { request_id }
            | Command::RunCell { request_id, .. }
            | Command::RunAllCells { request_id }
            | Command::GetCellTextOutput { request_id, .. }
            | Command::GetCellImageOutput { request_id, .. } => request_id,
        }
    }
}

// ─── Responses (host → controller) ───────────────────────────────────────────

/// Result fields for `insert_cell_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertCellBody {
    /// Synthetic id assigned to the inserted cell.
    pub cell_id: String,
    /// Position the cell actually landed at after clamping.
    pub position: usize,
    pub output_text: String,
    pub is_truncated: bool,
    pub has_images: bool,
}

/// Result fields for `save_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveBody {
    /// Resolved path the notebook was written to.
    pub path: String,
}

/// One entry in `cells_info_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellInfo {
    pub id: String,
    /// 0-based document position.
    pub position: usize,
    pub cell_type: CellType,
    pub source: String,
    /// Execution counter; `null` if the cell was never executed.
    pub execution_count: Option<u64>,
}

/// Result fields for `cells_info_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellsInfoBody {
    pub cells: Vec<CellInfo>,
}

/// Result fields for `notebook_info_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookInfoBody {
    pub name: String,
    pub path: String,
    pub kernel_name: String,
    pub cell_count: usize,
    pub unsaved_changes: bool,
    pub trusted: bool,
}

/// Captured-output fields shared by `run_cell_result` and
/// `get_cell_text_output_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutputBody {
    pub output_text: String,
    pub is_truncated: bool,
    pub has_images: bool,
}

/// Result fields for `get_cell_image_output_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOutputBody {
    pub images: Vec<ImagePayload>,
}

/// Responses produced by the host, one per command.
///
/// Every variant echoes `request_id` and carries `status`; on error the
/// result fields are absent and `message` explains which action failed and
/// why. Wire shape on success, e.g.:
/// `{"type":"run_cell_result","request_id":"r1","status":"success","output_text":"2",...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    InsertCellResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<InsertCellBody>,
    },
    SaveResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<SaveBody>,
    },
    CellsInfoResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<CellsInfoBody>,
    },
    NotebookInfoResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<NotebookInfoBody>,
    },
    RunCellResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<CellOutputBody>,
    },
    /// Acknowledgement only: run-all is issued, not awaited.
    RunAllCellsResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    GetCellTextOutputResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<CellOutputBody>,
    },
    GetCellImageOutputResult {
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Option<ImageOutputBody>,
    },
}

impl Response {
    /// The correlation id this response resolves.
    pub fn request_id(&self) -> &str {
        match self {
            Response::InsertCellResult { request_id, .. }
            | Response::SaveResult { request_id, .. }
            | Response::CellsInfoResult { request_id, .. }
            | Response::NotebookInfoResult { request_id, .. }
            | Response::RunCellResult { request_id, .. }
            | Response::RunAllCellsResult { request_id, .. }
            | Response::GetCellTextOutputResult { request_id, .. }
            | Response::GetCellImageOutputResult { request_id, .. } => request_id,
        }
    }

    /// The failure explanation, when one was attached.
    pub fn message(&self) -> Option<&str> {
        match self {
            Response::InsertCellResult { message, .. }
            | Response::SaveResult { message, .. }
            | Response::CellsInfoResult { message, .. }
            | Response::NotebookInfoResult { message, .. }
            | Response::RunCellResult { message, .. }
            | Response::RunAllCellsResult { message, .. }
            | Response::GetCellTextOutputResult { message, .. }
            | Response::GetCellImageOutputResult { message, .. } => message.as_deref(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::InsertCellResult { status, .. }
            | Response::SaveResult { status, .. }
            | Response::CellsInfoResult { status, .. }
            | Response::NotebookInfoResult { status, .. }
            | Response::RunCellResult { status, .. }
            | Response::RunAllCellsResult { status, .. }
            | Response::GetCellTextOutputResult { status, .. }
            | Response::GetCellImageOutputResult { status, .. } => *status,
        }
    }
}
