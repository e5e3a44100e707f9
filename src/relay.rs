//! Relay server: the controller-facing side of the bridge.
//!
//! The server accepts loopback TCP connections. The first frame on each
//! connection declares a role: `{"role": "notebook"}` registers the
//! connection as the host (superseding any previous host), anything else is
//! a controller. Commands from controllers are forwarded to the current
//! host; responses from the host are matched back to the pending request by
//! correlation id. Every wait is bounded by the request timeout, and a host
//! disconnect fails the requests that were in flight to it immediately
//! instead of letting them run out the clock.
//!
//! Correlation ids are scoped per submitter: before forwarding, the relay
//! swaps the caller's `request_id` for a fresh internal token and restores
//! the original on the way back, so two controllers reusing the same id can
//! never steal each other's responses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::correlation::{CorrelationTable, RelayError};
use crate::framing;
use crate::protocol::{Command, RoleDeclaration};
use crate::registry::ConnectionRegistry;
use crate::{DEFAULT_MAX_PORT_ATTEMPTS, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_SECS};

/// Owner id used for requests submitted in-process rather than by a socket
/// controller. Never discarded by connection teardown.
const LOCAL_OWNER: u64 = 0;

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind; the bridge is local-only by default.
    pub bind_addr: String,
    /// First port to try. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// How many consecutive ports to probe when the configured one is busy.
    pub max_port_attempts: u32,
    /// Deadline for every submitted request.
    pub request_timeout: Duration,
    /// How often the sweeper expires overdue table entries.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_port_attempts: DEFAULT_MAX_PORT_ATTEMPTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// The relay server. Owns the connection registry and the correlation table;
/// nothing else mutates them.
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    table: CorrelationTable,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl RelayServer {
    /// Bind the listening socket, probing subsequent ports when the
    /// configured one is already in use.
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Arc<Self>> {
        let mut port = config.port;
        let mut attempt = 0u32;
        let listener = loop {
            match TcpListener::bind((config.bind_addr.as_str(), port)).await {
                Ok(listener) => break listener,
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && attempt + 1 < config.max_port_attempts =>
                {
                    warn!("[relay] port {} is busy, trying {}", port, port + 1);
                    attempt += 1;
                    port += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "could not bind a port after {} attempt(s) (last tried {})",
                            attempt + 1,
                            port
                        )
                    });
                }
            }
        };
        let local_addr = listener.local_addr().context("listener has no local address")?;
        info!("[relay] listening on {}", local_addr);

        Ok(Arc::new(Self {
            config,
            listener,
            local_addr,
            registry: ConnectionRegistry::new(),
            table: CorrelationTable::new(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }

    /// The address actually bound, after any port probing.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Whether a host connection is currently registered.
    pub fn has_host(&self) -> bool {
        self.registry.has_host()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.table.len()
    }

    /// Request shutdown of the accept loop and the expiry sweeper.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }

    /// Run the accept loop until shutdown. Spawns the expiry sweeper.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweep_expired().await });

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                error!("[relay] connection {} failed: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("[relay] accept error: {}", e),
                },
                _ = self.shutdown_notify.notified() => {
                    info!("[relay] shutting down");
                    break;
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }

        self.table.cancel_all(RelayError::ConnectionClosed);
        Ok(())
    }

    /// Submit a typed command on behalf of an in-process caller (the
    /// tool-facing adapter) and wait for the correlated response envelope.
    pub async fn submit(&self, command: &Command) -> Result<Value, RelayError> {
        let envelope = serde_json::to_value(command)
            .map_err(|e| RelayError::Protocol(format!("unserializable command: {}", e)))?;
        self.submit_value(LOCAL_OWNER, envelope).await
    }

    /// Forward an envelope to the current host and suspend until the
    /// correlated response arrives, the deadline elapses, or the host goes
    /// away. Fails fast with `NoHostConnected` before registering anything.
    async fn submit_value(&self, owner: u64, mut envelope: Value) -> Result<Value, RelayError> {
        let original_id = envelope
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RelayError::Protocol("missing request_id".to_string()))?;

        let slot = self
            .registry
            .current_host()
            .ok_or(RelayError::NoHostConnected)?;

        let correlation_id = Uuid::new_v4().to_string();
        envelope["request_id"] = Value::String(correlation_id.clone());

        let deadline = Instant::now() + self.config.request_timeout;
        let mut rx = self
            .table
            .register(&correlation_id, owner, slot.generation, deadline)?;

        let frame = serde_json::to_vec(&envelope)
            .map_err(|e| RelayError::Protocol(format!("unserializable envelope: {}", e)))?;
        if slot.sender.send(frame).await.is_err() {
            self.table.discard(&correlation_id);
            return Err(RelayError::HostDisconnected);
        }

        match tokio::time::timeout(self.config.request_timeout, &mut rx).await {
            Ok(Ok(Ok(mut response))) => {
                response["request_id"] = Value::String(original_id);
                Ok(response)
            }
            Ok(Ok(Err(e))) => Err(e),
            // Sender dropped without a completion: table torn down.
            Ok(Err(_)) => Err(RelayError::ConnectionClosed),
            Err(_) => {
                if self.table.discard(&correlation_id) {
                    Err(RelayError::RequestTimeout)
                } else {
                    // The response landed between the timer firing and the
                    // discard; deliver it instead of dropping a result the
                    // host already produced.
                    match rx.try_recv() {
                        Ok(Ok(mut response)) => {
                            response["request_id"] = Value::String(original_id);
                            Ok(response)
                        }
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(RelayError::RequestTimeout),
                    }
                }
            }
        }
    }

    /// Periodically expire pending entries that outlived their deadline.
    async fn sweep_expired(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.table.expire_older_than(Instant::now());
                    if expired > 0 {
                        warn!("[relay] expired {} pending request(s)", expired);
                    }
                }
                _ = self.shutdown_notify.notified() => break,
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    /// Role negotiation for a fresh connection. Anything other than a role
    /// declaration as the first frame closes the connection.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let (mut reader, writer) = stream.into_split();

        let Some(first) = framing::recv_handshake_frame(&mut reader).await? else {
            return Ok(()); // closed before declaring a role
        };
        let role: RoleDeclaration = match serde_json::from_slice(&first) {
            Ok(role) => role,
            Err(e) => {
                warn!(
                    "[relay] closing {}: first frame is not a role declaration: {}",
                    peer, e
                );
                return Ok(());
            }
        };

        if role.is_notebook() {
            self.serve_host(reader, writer, peer).await;
        } else {
            self.serve_controller(reader, writer, peer, &role.role).await;
        }
        Ok(())
    }

    /// Serve the host connection: relay its responses into the correlation
    /// table until it disconnects or a newer host takes over.
    async fn serve_host(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        peer: SocketAddr,
    ) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
        let superseded = Arc::new(Notify::new());
        let generation = self.registry.install_host(tx, superseded.clone());
        info!(
            "[relay] notebook host connected from {} (generation {})",
            peer, generation
        );

        spawn_writer(writer, rx);

        loop {
            tokio::select! {
                frame = framing::recv_json_frame::<_, Value>(&mut reader) => match frame {
                    Ok(Some(envelope)) => self.route_response(envelope),
                    Ok(None) => {
                        info!("[relay] notebook host {} disconnected", peer);
                        break;
                    }
                    Err(e) => {
                        warn!("[relay] dropping notebook host {}: {}", peer, e);
                        break;
                    }
                },
                _ = superseded.notified() => {
                    info!("[relay] notebook host {} superseded by a newer connection", peer);
                    // Not the current host anymore: its in-flight requests
                    // resolve via timeout, not HostDisconnected.
                    return;
                }
                _ = self.shutdown_notify.notified() => break,
            }
        }

        if self.registry.clear_host(generation) {
            let cancelled = self.table.cancel_generation(generation);
            if cancelled > 0 {
                info!(
                    "[relay] failed {} pending request(s) after host disconnect",
                    cancelled
                );
            }
        }
    }

    /// Serve one controller connection: submit each incoming envelope and
    /// write the correlated response (or an error envelope) back.
    async fn serve_controller(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        peer: SocketAddr,
        declared_role: &str,
    ) {
        let owner = self.registry.next_owner();
        info!(
            "[relay] controller \"{}\" connected from {} (owner {})",
            declared_role, peer, owner
        );

        let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
        spawn_writer(writer, rx);

        let mut in_flight = JoinSet::new();
        loop {
            let frame = tokio::select! {
                frame = framing::recv_json_frame::<_, Value>(&mut reader) => frame,
                _ = self.shutdown_notify.notified() => break,
            };
            match frame {
                Ok(Some(envelope)) => {
                    let server = self.clone();
                    let reply_tx = tx.clone();
                    in_flight.spawn(async move {
                        let request_id = envelope
                            .get("request_id")
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        let reply = match server.submit_value(owner, envelope).await {
                            Ok(response) => response,
                            Err(e) => relay_error_envelope(request_id.as_deref(), &e),
                        };
                        match serde_json::to_vec(&reply) {
                            Ok(frame) => {
                                let _ = reply_tx.send(frame).await;
                            }
                            Err(e) => error!("[relay] unserializable reply: {}", e),
                        }
                    });
                }
                Ok(None) => {
                    info!("[relay] controller {} disconnected", peer);
                    break;
                }
                Err(e) => {
                    warn!("[relay] dropping controller {}: {}", peer, e);
                    break;
                }
            }
        }

        in_flight.abort_all();
        let discarded = self.table.discard_owner(owner);
        if discarded > 0 {
            info!(
                "[relay] discarded {} pending request(s) from departed controller {}",
                discarded, owner
            );
        }
    }

    /// Route a host envelope to its pending waiter; unknown, duplicate and
    /// malformed envelopes are logged and dropped, never fatal.
    fn route_response(&self, envelope: Value) {
        let Some(id) = envelope
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            warn!("[relay] discarding host message without request_id");
            return;
        };
        if !self.table.resolve(&id, envelope) {
            warn!(
                "[relay] discarding response for unknown or completed request {}",
                id
            );
        }
    }
}

/// Writer task: one per connection, fed through a channel so concurrent
/// request tasks never interleave partial frames.
fn spawn_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if framing::send_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });
}

/// Error envelope sent to socket controllers for bridge-level failures,
/// mirroring the host's `{"type": "error", ...}` shape.
fn relay_error_envelope(request_id: Option<&str>, err: &RelayError) -> Value {
    let mut envelope = json!({
        "type": "error",
        "message": err.to_string(),
    });
    if let Some(id) = request_id {
        envelope["request_id"] = Value::String(id.to_string());
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig {
            port: 0, // ephemeral; probing is exercised by integration tests
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bind_reports_actual_port() {
        let server = RelayServer::bind(test_config()).await.unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.local_addr().port(), server.port());
    }

    #[tokio::test]
    async fn test_submit_without_host_fails_fast_and_leaks_nothing() {
        let server = RelayServer::bind(test_config()).await.unwrap();

        for _ in 0..3 {
            let result = server
                .submit(&Command::SaveNotebook {
                    request_id: Uuid::new_v4().to_string(),
                })
                .await;
            assert_eq!(result.unwrap_err(), RelayError::NoHostConnected);
            assert_eq!(server.pending_requests(), 0);
        }
    }

    #[tokio::test]
    async fn test_submit_value_requires_request_id() {
        let server = RelayServer::bind(test_config()).await.unwrap();
        let result = server
            .submit_value(LOCAL_OWNER, json!({"type": "save_notebook"}))
            .await;
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_relay_error_envelope_shape() {
        let envelope = relay_error_envelope(Some("r1"), &RelayError::NoHostConnected);
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["request_id"], "r1");
        assert!(envelope["message"]
            .as_str()
            .unwrap()
            .contains("no notebook host"));

        let without_id = relay_error_envelope(None, &RelayError::RequestTimeout);
        assert!(without_id.get("request_id").is_none());
    }
}
