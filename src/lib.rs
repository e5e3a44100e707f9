//! nbrelay - Relay daemon bridging external tool controllers to a live
//! notebook session.
//!
//! A notebook frontend cannot be called into directly; it is only reachable
//! through a persistent socket and an event-driven script running inside it.
//! This crate makes that fire-and-forget frontend look like a synchronous RPC
//! target: the relay server accepts one host ("notebook") connection and any
//! number of controller connections, forwards command envelopes to the host,
//! and correlates out-of-order responses back to the matching pending request
//! with bounded waiting.
//!
//! All connections speak length-prefixed UTF-8 JSON frames over loopback TCP.
//! The first frame on every connection declares a role; see [`relay`] for the
//! negotiation rules and [`protocol`] for the envelope contracts.

pub mod client;
pub mod correlation;
pub mod framing;
pub mod handlers;
pub mod host;
pub mod output;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;

/// Default TCP port the relay listens on.
pub const DEFAULT_PORT: u16 = 8765;

/// Default number of ports probed when the configured port is already in use.
pub const DEFAULT_MAX_PORT_ATTEMPTS: u32 = 10;

/// Default time a submitted request may stay pending before it times out.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
