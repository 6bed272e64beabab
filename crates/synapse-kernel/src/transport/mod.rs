//! Correlation transports.
//!
//! A [`ModuleTransport`] turns one connection to one module into a
//! request/response channel: every [`call`](ModuleTransport::call) is stamped
//! with a fresh correlation id and resolves when the module answers with a
//! [`Response`] echoing that id, or fails with [`KernelError::Timeout`] /
//! [`KernelError::TransportClosed`].
//!
//! The kernel ships the duplex-stream implementation ([`StreamTransport`]);
//! other framings (e.g. the HTTP transport in `synapse-gateway`) implement
//! the same trait so the router never needs to know how a module is reached.
//!
//! [`KernelError::Timeout`]: crate::error::KernelError::Timeout
//! [`KernelError::TransportClosed`]: crate::error::KernelError::TransportClosed

mod stream;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{CONTROL_SHUTDOWN, Envelope, KERNEL_MODULE_NAME, Response, new_correlation_id};
use crate::error::Result;

pub use stream::StreamTransport;

/// An outgoing call, before the transport assigns its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub eventname: String,
    /// Module on whose behalf the call is made (`"kernel"` for directives).
    pub origin: String,
    pub payload: Value,
    pub timeout: Duration,
    pub credential: Option<Value>,
}

impl CallRequest {
    pub fn new(eventname: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        Self {
            eventname: eventname.into(),
            origin: KERNEL_MODULE_NAME.into(),
            payload,
            timeout,
            credential: None,
        }
    }

    /// Forward an inbound envelope to a subscriber, keeping its origin,
    /// payload and credential.
    pub fn forward(envelope: &Envelope, default_timeout: Duration) -> Self {
        Self {
            eventname: envelope.eventname.clone(),
            origin: envelope.modulename.clone(),
            payload: envelope.payload.clone(),
            timeout: envelope.timeout_or(default_timeout),
            credential: envelope.credential.clone(),
        }
    }

    /// The shutdown directive sent to every module on termination.
    pub fn shutdown(timeout: Duration) -> Self {
        Self::new(CONTROL_SHUTDOWN, Value::Null, timeout)
    }

    /// Materialise the request as an envelope with a fresh correlation id.
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            id: new_correlation_id(),
            modulename: self.origin,
            eventname: self.eventname,
            timeout: Some(crate::envelope::duration_millis(self.timeout)),
            payload: self.payload,
            credential: self.credential,
        }
    }
}

/// Point-in-time counters for one transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Calls currently waiting for a response.
    pub pending: usize,
    /// Responses dropped because no pending call matched their id.
    pub stale_responses: u64,
    /// Inbound frames that failed to decode.
    pub malformed_frames: u64,
}

/// A request/response channel to exactly one module.
#[async_trait]
pub trait ModuleTransport: Send + Sync {
    /// Send `request` to the module and wait for the matching response.
    async fn call(&self, request: CallRequest) -> Result<Response>;

    /// Whether the underlying connection has ended.
    fn is_closed(&self) -> bool;

    /// Close the connection, failing every outstanding call.
    fn close(&self);

    /// Short name of the framing, for logs.
    fn kind(&self) -> &'static str;

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}
