//! Controller client: the synchronous-looking face of the bridge.
//!
//! `ControllerClient` connects to the relay, declares the controller role,
//! and exposes one async method per command. Each call generates its own
//! correlation id, submits the command, and suspends until the matching
//! reply arrives or the client-side deadline elapses. Replies are matched
//! by a local correlation table fed from a background reader task, so calls
//! can overlap freely on one connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::correlation::{CorrelationTable, RelayError};
use crate::framing;
use crate::protocol::{
    CellOutputBody, CellType, CellsInfoBody, Command, ImageOutputBody, InsertCellBody,
    NotebookInfoBody, Response, RoleDeclaration, SaveBody, Status,
};
use crate::DEFAULT_REQUEST_TIMEOUT_SECS;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to the relay: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    /// The bridge itself failed the request (no host, relay timeout).
    #[error("bridge error: {0}")]
    Relay(String),

    /// The notebook host handled the command and reported a failure.
    #[error("notebook error: {0}")]
    Host(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("connection to the relay was closed")]
    Disconnected,
}

/// A connected controller. Cloning the client is not supported; share it
/// behind an `Arc` to issue overlapping calls.
pub struct ControllerClient {
    tx: mpsc::Sender<Vec<u8>>,
    table: Arc<CorrelationTable>,
    request_timeout: Duration,
}

impl ControllerClient {
    /// Connect and declare the controller role. The background reader task
    /// lives as long as the connection.
    pub async fn connect(addr: &str, port: u16) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((addr, port)).await?;
        let (mut reader, mut writer) = stream.into_split();

        framing::send_json_frame(&mut writer, &RoleDeclaration::controller())
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let (tx, mut frames) = mpsc::channel::<Vec<u8>>(32);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if framing::send_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        let table = Arc::new(CorrelationTable::new());
        let reader_table = table.clone();
        tokio::spawn(async move {
            loop {
                match framing::recv_json_frame::<_, Value>(&mut reader).await {
                    Ok(Some(reply)) => {
                        let Some(id) = reply
                            .get("request_id")
                            .and_then(Value::as_str)
                            .map(str::to_owned)
                        else {
                            warn!("[client] discarding reply without request_id");
                            continue;
                        };
                        if !reader_table.resolve(&id, reply) {
                            debug!("[client] discarding reply for unknown request {}", id);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[client] connection failed: {}", e);
                        break;
                    }
                }
            }
            reader_table.cancel_all(RelayError::ConnectionClosed);
        });

        Ok(Self {
            tx,
            table,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    /// Override the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Submit one command and wait for its correlated reply.
    pub async fn submit(&self, command: Command) -> Result<Response, ClientError> {
        let id = command.request_id().to_owned();
        let deadline = Instant::now() + self.request_timeout;
        let mut rx = self
            .table
            .register(&id, 0, 0, deadline)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let frame =
            serde_json::to_vec(&command).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if self.tx.send(frame).await.is_err() {
            self.table.discard(&id);
            return Err(ClientError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(Ok(reply))) => parse_reply(reply),
            Ok(Ok(Err(RelayError::ConnectionClosed))) => Err(ClientError::Disconnected),
            Ok(Ok(Err(e))) => Err(ClientError::Protocol(e.to_string())),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.table.discard(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    pub async fn insert_and_execute(
        &self,
        position: usize,
        cell_type: CellType,
        content: &str,
    ) -> Result<InsertCellBody, ClientError> {
        let response = self
            .submit(Command::InsertAndExecuteCell {
                request_id: next_request_id(),
                position,
                cell_type,
                content: content.to_string(),
            })
            .await?;
        match response {
            Response::InsertCellResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("insert_cell_result", &other)),
        }
    }

    pub async fn save_notebook(&self) -> Result<SaveBody, ClientError> {
        let response = self
            .submit(Command::SaveNotebook {
                request_id: next_request_id(),
            })
            .await?;
        match response {
            Response::SaveResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("save_result", &other)),
        }
    }

    pub async fn get_cells_info(&self) -> Result<CellsInfoBody, ClientError> {
        let response = self
            .submit(Command::GetCellsInfo {
                request_id: next_request_id(),
            })
            .await?;
        match response {
            Response::CellsInfoResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("cells_info_result", &other)),
        }
    }

    pub async fn get_notebook_info(&self) -> Result<NotebookInfoBody, ClientError> {
        let response = self
            .submit(Command::GetNotebookInfo {
                request_id: next_request_id(),
            })
            .await?;
        match response {
            Response::NotebookInfoResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("notebook_info_result", &other)),
        }
    }

    pub async fn run_cell(&self, index: i64) -> Result<CellOutputBody, ClientError> {
        let response = self
            .submit(Command::RunCell {
                request_id: next_request_id(),
                index,
            })
            .await?;
        match response {
            Response::RunCellResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("run_cell_result", &other)),
        }
    }

    /// Acknowledged once the run is issued; completion is not awaited.
    pub async fn run_all_cells(&self) -> Result<(), ClientError> {
        let response = self
            .submit(Command::RunAllCells {
                request_id: next_request_id(),
            })
            .await?;
        match response {
            Response::RunAllCellsResult { .. } => Ok(()),
            other => Err(mismatched("run_all_cells_result", &other)),
        }
    }

    pub async fn get_cell_text_output(
        &self,
        index: i64,
        max_length: Option<usize>,
    ) -> Result<CellOutputBody, ClientError> {
        let response = self
            .submit(Command::GetCellTextOutput {
                request_id: next_request_id(),
                index,
                max_length: max_length.unwrap_or(crate::output::DEFAULT_MAX_OUTPUT_LENGTH),
            })
            .await?;
        match response {
            Response::GetCellTextOutputResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("get_cell_text_output_result", &other)),
        }
    }

    pub async fn get_cell_image_output(&self, index: i64) -> Result<ImageOutputBody, ClientError> {
        let response = self
            .submit(Command::GetCellImageOutput {
                request_id: next_request_id(),
                index,
            })
            .await?;
        match response {
            Response::GetCellImageOutputResult {
                body: Some(body), ..
            } => Ok(body),
            other => Err(mismatched("get_cell_image_output_result", &other)),
        }
    }
}

fn next_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn mismatched(expected: &str, got: &Response) -> ClientError {
    ClientError::Protocol(format!(
        "expected {} but got a different reply for request {}",
        expected,
        got.request_id()
    ))
}

/// Sort a raw reply envelope into the three failure layers: bridge error
/// envelopes, host-reported errors, and everything unparseable.
fn parse_reply(reply: Value) -> Result<Response, ClientError> {
    if reply.get("type").and_then(Value::as_str) == Some("error") {
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified bridge error")
            .to_string();
        return Err(ClientError::Relay(message));
    }

    let response: Response = serde_json::from_value(reply)
        .map_err(|e| ClientError::Protocol(format!("unrecognized reply: {}", e)))?;
    if response.status() == Status::Error {
        let message = response
            .message()
            .unwrap_or("unspecified notebook error")
            .to_string();
        return Err(ClientError::Host(message));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_reply_error_envelope_is_relay_error() {
        let reply = json!({
            "type": "error",
            "request_id": "r1",
            "message": "no notebook host connected",
        });
        match parse_reply(reply) {
            Err(ClientError::Relay(m)) => assert!(m.contains("no notebook host")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_host_error_status() {
        let reply = json!({
            "type": "run_cell_result",
            "request_id": "r2",
            "status": "error",
            "message": "cell index 9 is out of range (notebook has 1 cells)",
        });
        match parse_reply(reply) {
            Err(ClientError::Host(m)) => assert!(m.contains("out of range")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_success() {
        let reply = json!({
            "type": "run_cell_result",
            "request_id": "r3",
            "status": "success",
            "output_text": "2",
            "is_truncated": false,
            "has_images": false,
        });
        match parse_reply(reply) {
            Ok(Response::RunCellResult {
                body: Some(body), ..
            }) => assert_eq!(body.output_text, "2"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_garbage_is_protocol_error() {
        let reply = json!({"type": "something_else", "request_id": "r4"});
        assert!(matches!(
            parse_reply(reply),
            Err(ClientError::Protocol(_))
        ));
    }
}
