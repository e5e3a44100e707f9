//! Command handlers running on the host side.
//!
//! `dispatch` turns one command into exactly one response. Failures never
//! escape as errors; they become a response with `status: error` and a
//! message naming the action that failed, so the relay always has something
//! to correlate.

use thiserror::Error;

use crate::output::{self, CapturedOutput, DEFAULT_MAX_OUTPUT_LENGTH};
use crate::protocol::{
    CellInfo, CellOutputBody, CellType, CellsInfoBody, Command, ImageOutputBody, InsertCellBody,
    NotebookInfoBody, Response, SaveBody, Status,
};
use crate::session::{NotebookSession, SessionError};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("cell index {index} is out of range (notebook has {count} cells)")]
    IndexOutOfRange { index: i64, count: usize },

    #[error("cell execution was abandoned before completing")]
    ExecutionAborted,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Handle one command against the session and build the matching response.
pub async fn dispatch<S: NotebookSession>(session: &S, command: Command) -> Response {
    match command {
        Command::InsertAndExecuteCell {
            request_id,
            position,
            cell_type,
            content,
        } => match insert_and_execute(session, position, cell_type, &content).await {
            Ok(body) => Response::InsertCellResult {
                request_id,
                status: Status::Success,
                message: None,
                body: Some(body),
            },
            Err(e) => Response::InsertCellResult {
                request_id,
                status: Status::Error,
                message: Some(format!("could not insert cell: {}", e)),
                body: None,
            },
        },

        Command::SaveNotebook { request_id } => match session.save() {
            Ok(path) => Response::SaveResult {
                request_id,
                status: Status::Success,
                message: None,
                body: Some(SaveBody {
                    path: path.display().to_string(),
                }),
            },
            Err(e) => Response::SaveResult {
                request_id,
                status: Status::Error,
                message: Some(e.to_string()),
                body: None,
            },
        },

        Command::GetCellsInfo { request_id } => Response::CellsInfoResult {
            request_id,
            status: Status::Success,
            message: None,
            body: Some(cells_info(session)),
        },

        Command::GetNotebookInfo { request_id } => {
            let info = session.describe();
            Response::NotebookInfoResult {
                request_id,
                status: Status::Success,
                message: None,
                body: Some(NotebookInfoBody {
                    name: info.name,
                    path: info.path.display().to_string(),
                    kernel_name: info.kernel_name,
                    cell_count: session.cells().len(),
                    unsaved_changes: info.unsaved_changes,
                    trusted: info.trusted,
                }),
            }
        }

        Command::RunCell { request_id, index } => match run_cell(session, index).await {
            Ok(body) => Response::RunCellResult {
                request_id,
                status: Status::Success,
                message: None,
                body: Some(body),
            },
            Err(e) => Response::RunCellResult {
                request_id,
                status: Status::Error,
                message: Some(format!("could not run cell: {}", e)),
                body: None,
            },
        },

        Command::RunAllCells { request_id } => match session.restart_and_run_all() {
            // Issued, not awaited: the acknowledgement goes out immediately.
            Ok(()) => Response::RunAllCellsResult {
                request_id,
                status: Status::Success,
                message: None,
            },
            Err(e) => Response::RunAllCellsResult {
                request_id,
                status: Status::Error,
                message: Some(format!("could not start run-all: {}", e)),
            },
        },

        Command::GetCellTextOutput {
            request_id,
            index,
            max_length,
        } => match captured_output(session, index, Some(max_length)) {
            Ok(captured) => {
                let has_images = captured.has_images();
                Response::GetCellTextOutputResult {
                    request_id,
                    status: Status::Success,
                    message: None,
                    body: Some(CellOutputBody {
                        output_text: captured.text,
                        is_truncated: captured.is_truncated,
                        has_images,
                    }),
                }
            }
            Err(e) => Response::GetCellTextOutputResult {
                request_id,
                status: Status::Error,
                message: Some(format!("could not fetch cell output: {}", e)),
                body: None,
            },
        },

        Command::GetCellImageOutput { request_id, index } => {
            match captured_output(session, index, None) {
                Ok(captured) => Response::GetCellImageOutputResult {
                    request_id,
                    status: Status::Success,
                    message: None,
                    body: Some(ImageOutputBody {
                        images: captured.images,
                    }),
                },
                Err(e) => Response::GetCellImageOutputResult {
                    request_id,
                    status: Status::Error,
                    message: Some(format!("could not fetch cell images: {}", e)),
                    body: None,
                },
            }
        }
    }
}

async fn insert_and_execute<S: NotebookSession>(
    session: &S,
    position: usize,
    cell_type: CellType,
    content: &str,
) -> Result<InsertCellBody, HandlerError> {
    let landed = position.min(session.cells().len());
    let cell_id = session.insert_cell(landed, cell_type, content)?;

    let captured = if cell_type == CellType::Code {
        let done = session.execute_cell(&cell_id)?;
        done.await.map_err(|_| HandlerError::ExecutionAborted)?;
        capture_by_id(session, &cell_id, Some(DEFAULT_MAX_OUTPUT_LENGTH))
    } else {
        CapturedOutput::default()
    };

    let has_images = captured.has_images();
    Ok(InsertCellBody {
        cell_id,
        position: landed,
        output_text: captured.text,
        is_truncated: captured.is_truncated,
        has_images,
    })
}

async fn run_cell<S: NotebookSession>(
    session: &S,
    index: i64,
) -> Result<CellOutputBody, HandlerError> {
    let cells = session.cells();
    let resolved = resolve_index(index, cells.len())?;
    let cell_id = cells[resolved].id.clone();

    let done = session.execute_cell(&cell_id)?;
    done.await.map_err(|_| HandlerError::ExecutionAborted)?;

    let captured = capture_by_id(session, &cell_id, Some(DEFAULT_MAX_OUTPUT_LENGTH));
    let has_images = captured.has_images();
    Ok(CellOutputBody {
        output_text: captured.text,
        is_truncated: captured.is_truncated,
        has_images,
    })
}

/// Snapshot the outputs of the cell at `index`. Non-code cells and cells
/// without outputs report an empty capture rather than an error.
fn captured_output<S: NotebookSession>(
    session: &S,
    index: i64,
    max_length: Option<usize>,
) -> Result<CapturedOutput, HandlerError> {
    let cells = session.cells();
    let resolved = resolve_index(index, cells.len())?;
    let cell = &cells[resolved];
    if cell.cell_type != CellType::Code || cell.outputs.is_empty() {
        return Ok(CapturedOutput::default());
    }
    Ok(output::capture(&cell.outputs, max_length))
}

fn cells_info<S: NotebookSession>(session: &S) -> CellsInfoBody {
    let cells = session
        .cells()
        .into_iter()
        .enumerate()
        .map(|(position, cell)| CellInfo {
            id: cell.id,
            position,
            cell_type: cell.cell_type,
            source: cell.source,
            execution_count: cell.execution_count,
        })
        .collect();
    CellsInfoBody { cells }
}

/// Map a signed wire index onto the document. Negative indices and indices
/// past the end are rejected before any mutation happens.
fn resolve_index(index: i64, count: usize) -> Result<usize, HandlerError> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < count)
        .ok_or(HandlerError::IndexOutOfRange { index, count })
}

/// Re-capture a cell by id after execution, since it may have moved.
fn capture_by_id<S: NotebookSession>(
    session: &S,
    cell_id: &str,
    max_length: Option<usize>,
) -> CapturedOutput {
    session
        .cells()
        .iter()
        .find(|c| c.id == cell_id)
        .map(|c| output::capture(&c.outputs, max_length))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::output::OutputItem;
    use crate::session::{InMemoryNotebook, ScriptedExecutor};

    fn scripted(executor: ScriptedExecutor) -> InMemoryNotebook {
        InMemoryNotebook::new(
            "scratch",
            "/tmp/scratch.ipynb",
            "python3",
            Arc::new(executor),
        )
    }

    #[tokio::test]
    async fn test_insert_code_cell_executes_and_captures() {
        let nb = scripted(ScriptedExecutor::new().respond("1+1", vec![OutputItem::stream("2")]));

        let response = dispatch(
            &nb,
            Command::InsertAndExecuteCell {
                request_id: "r1".into(),
                position: 0,
                cell_type: CellType::Code,
                content: "1+1".into(),
            },
        )
        .await;

        match response {
            Response::InsertCellResult {
                status: Status::Success,
                body: Some(body),
                ..
            } => {
                assert_eq!(body.output_text, "2");
                assert_eq!(body.position, 0);
                assert!(!body.is_truncated);
                assert!(!body.has_images);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(nb.cells()[0].execution_count, Some(1));
    }

    #[tokio::test]
    async fn test_insert_markdown_responds_without_executing() {
        let nb = scripted(ScriptedExecutor::new());

        let response = dispatch(
            &nb,
            Command::InsertAndExecuteCell {
                request_id: "r2".into(),
                position: 7, // clamped to the end of the empty document
                cell_type: CellType::Markdown,
                content: "# notes".into(),
            },
        )
        .await;

        match response {
            Response::InsertCellResult {
                status: Status::Success,
                body: Some(body),
                ..
            } => {
                assert_eq!(body.position, 0);
                assert!(body.output_text.is_empty());
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(nb.cells()[0].execution_count, None);
    }

    #[tokio::test]
    async fn test_run_cell_rejects_out_of_range_without_mutation() {
        let nb = scripted(ScriptedExecutor::new().respond("x", vec![OutputItem::stream("x")]));
        nb.insert_cell(0, CellType::Code, "x").unwrap();

        for index in [-1i64, 1, 99] {
            let response = dispatch(
                &nb,
                Command::RunCell {
                    request_id: "r3".into(),
                    index,
                },
            )
            .await;
            match response {
                Response::RunCellResult {
                    status: Status::Error,
                    message: Some(m),
                    body: None,
                    ..
                } => assert!(m.contains("out of range"), "message: {}", m),
                other => panic!("unexpected response: {:?}", other),
            }
        }
        // The existing cell was never touched.
        assert_eq!(nb.cells()[0].execution_count, None);
    }

    #[tokio::test]
    async fn test_run_cell_captures_output() {
        let nb = scripted(
            ScriptedExecutor::new().respond("print('hi')", vec![OutputItem::stream("hi\n")]),
        );
        nb.insert_cell(0, CellType::Code, "print('hi')").unwrap();

        let response = dispatch(
            &nb,
            Command::RunCell {
                request_id: "r4".into(),
                index: 0,
            },
        )
        .await;

        match response {
            Response::RunCellResult {
                status: Status::Success,
                body: Some(body),
                ..
            } => assert_eq!(body.output_text, "hi\n"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_cell_tracks_its_cell_across_concurrent_inserts() {
        use std::sync::Mutex;

        use tokio::sync::oneshot;

        use crate::session::{CellExecutor, Execution};

        struct Deferred {
            outputs: Mutex<Option<oneshot::Sender<Vec<OutputItem>>>>,
        }
        impl CellExecutor for Deferred {
            fn execute(&self, _source: &str) -> Execution {
                let (tx, rx) = oneshot::channel();
                if let Ok(mut slot) = self.outputs.lock() {
                    *slot = Some(tx);
                }
                Execution::Pending(rx)
            }
        }

        let executor = Arc::new(Deferred {
            outputs: Mutex::new(None),
        });
        let nb = InMemoryNotebook::new(
            "scratch",
            "/tmp/scratch.ipynb",
            "python3",
            executor.clone(),
        );
        nb.insert_cell(0, CellType::Code, "target").unwrap();

        let handle = tokio::spawn({
            let nb = nb.clone();
            async move {
                dispatch(
                    &nb,
                    Command::RunCell {
                        request_id: "r7".into(),
                        index: 0,
                    },
                )
                .await
            }
        });

        // Wait for the execution to be in flight, then shift the target cell
        // down by inserting above it before releasing the output.
        let tx = loop {
            if let Some(tx) = executor.outputs.lock().unwrap().take() {
                break tx;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        nb.insert_cell(0, CellType::Code, "intruder").unwrap();
        tx.send(vec![OutputItem::stream("moved")]).unwrap();

        match handle.await.unwrap() {
            Response::RunCellResult {
                status: Status::Success,
                body: Some(body),
                ..
            } => assert_eq!(body.output_text, "moved"),
            other => panic!("unexpected response: {:?}", other),
        }
        // The output landed on the cell that was asked to run, not on
        // whatever now sits at its old index.
        let cells = nb.cells();
        assert!(cells[0].outputs.is_empty());
        assert_eq!(cells[1].outputs[0].text.as_deref(), Some("moved"));
        assert_eq!(cells[1].execution_count, Some(1));
    }

    #[tokio::test]
    async fn test_text_output_honors_max_length() {
        let long = "a".repeat(100);
        let nb = scripted(ScriptedExecutor::new().respond("big", vec![OutputItem::stream(&long)]));
        nb.insert_cell(0, CellType::Code, "big").unwrap();
        dispatch(
            &nb,
            Command::RunCell {
                request_id: "r5".into(),
                index: 0,
            },
        )
        .await;

        let response = dispatch(
            &nb,
            Command::GetCellTextOutput {
                request_id: "r6".into(),
                index: 0,
                max_length: 10,
            },
        )
        .await;

        match response {
            Response::GetCellTextOutputResult {
                body: Some(body), ..
            } => {
                assert_eq!(body.output_text.len(), 10);
                assert!(body.is_truncated);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_output_of_markdown_cell_is_empty() {
        let nb = scripted(ScriptedExecutor::new());
        nb.insert_cell(0, CellType::Markdown, "# title").unwrap();

        let response = dispatch(
            &nb,
            Command::GetCellTextOutput {
                request_id: "r7".into(),
                index: 0,
                max_length: DEFAULT_MAX_OUTPUT_LENGTH,
            },
        )
        .await;

        match response {
            Response::GetCellTextOutputResult {
                status: Status::Success,
                body: Some(body),
                ..
            } => {
                assert!(body.output_text.is_empty());
                assert!(!body.is_truncated);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_image_output_extraction() {
        let nb = scripted(ScriptedExecutor::new().respond(
            "plot()",
            vec![OutputItem::mime("image/png", "iVBORw0KGgo=")],
        ));
        nb.insert_cell(0, CellType::Code, "plot()").unwrap();
        dispatch(
            &nb,
            Command::RunCell {
                request_id: "r8".into(),
                index: 0,
            },
        )
        .await;

        let response = dispatch(
            &nb,
            Command::GetCellImageOutput {
                request_id: "r9".into(),
                index: 0,
            },
        )
        .await;

        match response {
            Response::GetCellImageOutputResult {
                body: Some(body), ..
            } => {
                assert_eq!(body.images.len(), 1);
                assert_eq!(body.images[0].data, "iVBORw0KGgo=");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_all_acknowledges_immediately() {
        let nb = scripted(ScriptedExecutor::new());
        nb.insert_cell(0, CellType::Code, "a").unwrap();

        let response = dispatch(
            &nb,
            Command::RunAllCells {
                request_id: "r10".into(),
            },
        )
        .await;
        assert!(matches!(
            response,
            Response::RunAllCellsResult {
                status: Status::Success,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_save_error_carries_message() {
        let nb = InMemoryNotebook::new(
            "nb",
            "/nonexistent-dir/nb.ipynb",
            "python3",
            Arc::new(ScriptedExecutor::new()),
        );

        let response = dispatch(
            &nb,
            Command::SaveNotebook {
                request_id: "r11".into(),
            },
        )
        .await;
        match response {
            Response::SaveResult {
                status: Status::Error,
                message: Some(m),
                body: None,
                ..
            } => assert!(m.contains("could not save"), "message: {}", m),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notebook_and_cells_info() {
        let nb = scripted(ScriptedExecutor::new());
        nb.insert_cell(0, CellType::Code, "1+1").unwrap();
        nb.insert_cell(1, CellType::Markdown, "# t").unwrap();

        let info = dispatch(
            &nb,
            Command::GetNotebookInfo {
                request_id: "r12".into(),
            },
        )
        .await;
        match info {
            Response::NotebookInfoResult {
                body: Some(body), ..
            } => {
                assert_eq!(body.cell_count, 2);
                assert_eq!(body.kernel_name, "python3");
                assert!(body.unsaved_changes);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let cells = dispatch(
            &nb,
            Command::GetCellsInfo {
                request_id: "r13".into(),
            },
        )
        .await;
        match cells {
            Response::CellsInfoResult {
                body: Some(body), ..
            } => {
                assert_eq!(body.cells.len(), 2);
                assert_eq!(body.cells[0].position, 0);
                assert_eq!(body.cells[1].cell_type, CellType::Markdown);
                assert_eq!(body.cells[0].execution_count, None);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
