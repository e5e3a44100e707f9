//! Host endpoint: connects the notebook session to the relay.
//!
//! The endpoint dials the relay, declares the notebook role, then serves
//! commands until the connection drops. A supervised loop reconnects with
//! bounded doubling backoff, reset after every successful connect, so a
//! relay restart does not strand the notebook.
//!
//! Each command is dispatched on its own task; a long-running execution
//! never blocks the read loop, and responses are serialized through a
//! single writer task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

use crate::framing;
use crate::handlers;
use crate::protocol::{Command, RoleDeclaration};
use crate::session::NotebookSession;
use crate::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub addr: String,
    pub port: u16,
    /// First reconnect delay; doubles on consecutive failures.
    pub initial_backoff: Duration,
    /// Ceiling for the doubling backoff.
    pub max_backoff: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// The notebook side of the bridge.
pub struct HostEndpoint<S> {
    session: Arc<S>,
    config: HostConfig,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl<S: NotebookSession> HostEndpoint<S> {
    pub fn new(session: Arc<S>, config: HostConfig) -> Arc<Self> {
        Arc::new(Self {
            session,
            config,
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// Ask the reconnect loop to wind down.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.stop_notify.notify_waiters();
    }

    /// Connect, serve, reconnect. Returns once `stop` is called.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut backoff = self.config.initial_backoff;
        while !self.stop.load(Ordering::Relaxed) {
            match self.connect_and_serve().await {
                Ok(()) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    info!("[host] relay connection closed, reconnecting");
                    backoff = self.config.initial_backoff;
                }
                Err(e) => {
                    warn!("[host] could not reach relay: {:#}, retrying in {:?}", e, backoff);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.stop_notify.notified() => break,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
        info!("[host] stopped");
        Ok(())
    }

    /// One connection lifetime: handshake, then serve until EOF or stop.
    async fn connect_and_serve(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect((self.config.addr.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!("connecting to {}:{}", self.config.addr, self.config.port)
            })?;
        let (mut reader, mut writer) = stream.into_split();

        framing::send_json_frame(&mut writer, &RoleDeclaration::notebook())
            .await
            .context("declaring notebook role")?;
        info!(
            "[host] connected to relay at {}:{}",
            self.config.addr, self.config.port
        );

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if framing::send_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                frame = framing::recv_json_frame::<_, Value>(&mut reader) => match frame {
                    Ok(Some(envelope)) => self.handle_envelope(envelope, &tx, &mut in_flight),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[host] relay connection failed: {}", e);
                        break;
                    }
                },
                _ = self.stop_notify.notified() => break,
            }
        }

        // The connection is gone, so in-flight responses have nowhere to
        // go; abort them rather than stalling the reconnect.
        in_flight.shutdown().await;
        Ok(())
    }

    /// Parse and dispatch one command envelope on its own task.
    fn handle_envelope(
        &self,
        envelope: Value,
        tx: &mpsc::Sender<Vec<u8>>,
        in_flight: &mut JoinSet<()>,
    ) {
        let command: Command = match serde_json::from_value(envelope.clone()) {
            Ok(command) => command,
            Err(e) => {
                warn!("[host] rejecting malformed command: {}", e);
                let request_id = envelope
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                let reply = command_error_envelope(
                    request_id.as_deref(),
                    &format!("malformed command: {}", e),
                );
                let tx = tx.clone();
                in_flight.spawn(async move {
                    if let Ok(frame) = serde_json::to_vec(&reply) {
                        let _ = tx.send(frame).await;
                    }
                });
                return;
            }
        };

        let session = self.session.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = handlers::dispatch(session.as_ref(), command).await;
            match serde_json::to_vec(&response) {
                Ok(frame) => {
                    let _ = tx.send(frame).await;
                }
                Err(e) => warn!("[host] unserializable response: {}", e),
            }
        });
    }
}

/// Error envelope for commands that never reached a handler.
fn command_error_envelope(request_id: Option<&str>, message: &str) -> Value {
    let mut envelope = json!({
        "type": "error",
        "message": message,
    });
    if let Some(id) = request_id {
        envelope["request_id"] = Value::String(id.to_string());
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_envelope_shape() {
        let envelope = command_error_envelope(Some("r1"), "malformed command: missing field");
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["request_id"], "r1");
        assert!(envelope["message"].as_str().unwrap().contains("malformed"));

        assert!(command_error_envelope(None, "x").get("request_id").is_none());
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let config = HostConfig::default();
        let mut backoff = config.initial_backoff;
        for _ in 0..10 {
            backoff = (backoff * 2).min(config.max_backoff);
        }
        assert_eq!(backoff, config.max_backoff);
    }
}
