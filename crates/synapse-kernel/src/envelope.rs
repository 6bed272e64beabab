//! Wire-level message types.
//!
//! Two shapes of message flow between the kernel and its modules:
//!
//! - [`Envelope`] -- a request.  Carries a caller-generated correlation id,
//!   the caller's module name, the event name, a timeout and an opaque JSON
//!   payload the kernel never inspects.
//! - [`Response`] -- a reply.  Echoes the correlation id of the envelope it
//!   answers and carries an HTTP-like `statuscode`.
//!
//! Field names are lowercase without separators (`modulename`,
//! `eventname`, `statuscode`) because that is what deployed modules put on
//! the wire.

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::KernelError;

// ---------------------------------------------------------------------------
// Reserved event names
// ---------------------------------------------------------------------------

/// Subscribe the caller to `payload.eventname`.
pub const KERNEL_SUBSCRIBE: &str = "kernel/subscribe";
/// Unsubscribe the caller from `payload.eventname`.
pub const KERNEL_UNSUBSCRIBE: &str = "kernel/unsubscribe";
/// Register the caller as an active module.
pub const KERNEL_INIT: &str = "kernel/init";
/// Remove the caller and every subscription it holds.
pub const KERNEL_DISPOSE: &str = "kernel/dispose";
/// Append `payload.message` to the kernel log sink.
pub const KERNEL_LOG: &str = "kernel/log";
/// Sent by the kernel to every module when it shuts down.
pub const CONTROL_SHUTDOWN: &str = "control/shutdown";

/// Module name used on responses the kernel synthesizes itself.
pub const KERNEL_MODULE_NAME: &str = "kernel";

/// Correlation token pairing one request with its response.
pub type CorrelationId = Uuid;

/// Generate a fresh, time-ordered correlation id.
pub fn new_correlation_id() -> CorrelationId {
    Uuid::now_v7()
}

// ---------------------------------------------------------------------------
// ModuleId
// ---------------------------------------------------------------------------

/// Stable identity of a connected module, chosen at `kernel/init` time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ModuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ModuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// DetailedStatus
// ---------------------------------------------------------------------------

/// Machine-readable refinement of a response's `statuscode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailedStatus {
    /// Nobody is subscribed to the dispatched event.
    NoSubscriptions,
    Timeout,
    TransportClosed,
    MalformedMessage,
    UnknownModule,
    ModuleAlreadyActive,
    ShuttingDown,
    SinkFailure,
    ReservedEvent,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A request travelling in either direction between kernel and module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: CorrelationId,
    #[serde(default)]
    pub modulename: String,
    #[serde(default)]
    pub eventname: String,
    /// Milliseconds the receiver may spend answering; `None` means the
    /// kernel's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub payload: Value,
    /// Opaque pass-through token, never validated by the kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Value>,
}

impl Envelope {
    /// Build a request with a fresh correlation id.
    pub fn new(
        modulename: impl Into<String>,
        eventname: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: new_correlation_id(),
            modulename: modulename.into(),
            eventname: eventname.into(),
            timeout: None,
            payload,
            credential: None,
        }
    }

    /// Set the timeout the receiver should honour.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(duration_millis(timeout));
        self
    }

    /// The envelope's timeout, or `default` when none was supplied.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Payload of `kernel/subscribe` and `kernel/unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub eventname: String,
}

/// Payload of `kernel/log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A reply to an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echoes the id of the envelope being answered.  Modules reached over
    /// HTTP may omit it; the transport fills it in.
    #[serde(default)]
    pub id: CorrelationId,
    #[serde(default)]
    pub modulename: String,
    pub statuscode: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailedstatus: Option<DetailedStatus>,
    #[serde(default)]
    pub content: Value,
}

impl Response {
    /// A 200 response carrying `content`.
    pub fn ok(id: CorrelationId, modulename: impl Into<String>, content: Value) -> Self {
        Self {
            id,
            modulename: modulename.into(),
            statuscode: 200,
            detailedstatus: None,
            content,
        }
    }

    /// The kernel's soft failure for an event nobody listens to.
    pub fn no_subscriptions(id: CorrelationId) -> Self {
        Self {
            id,
            modulename: KERNEL_MODULE_NAME.into(),
            statuscode: 207,
            detailedstatus: Some(DetailedStatus::NoSubscriptions),
            content: Value::Array(Vec::new()),
        }
    }

    /// An error-coded response standing in for a failed call.
    pub fn from_error(
        id: CorrelationId,
        modulename: impl Into<String>,
        error: &KernelError,
    ) -> Self {
        Self {
            id,
            modulename: modulename.into(),
            statuscode: error.status_code(),
            detailedstatus: error.detailed_status(),
            content: serde_json::json!({ "error": error.to_string() }),
        }
    }

    /// Whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.statuscode)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One message on a duplex stream.
///
/// Responses are recognised by their mandatory `statuscode`; anything else
/// that parses is a request.  The `Response` arm must stay first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Response(Response),
    Request(Envelope),
}

impl Frame {
    /// Decode a single frame from one line of text.
    pub fn decode(line: &str) -> Result<Self, KernelError> {
        serde_json::from_str(line).map_err(|e| KernelError::MalformedMessage {
            reason: e.to_string(),
        })
    }

    /// Encode the frame as one newline-terminated line.
    pub fn encode(&self) -> Result<String, KernelError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// The kernel's answer to one inbound envelope, independent of framing.
///
/// Over HTTP `statuscode` becomes the status line and `responses` the JSON
/// body; on a duplex stream both are folded into one [`Response`] via
/// [`Reply::into_response`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub statuscode: u16,
    pub responses: Vec<Response>,
}

impl Reply {
    /// A 200 reply with no body.
    pub fn ok() -> Self {
        Self {
            statuscode: 200,
            responses: Vec::new(),
        }
    }

    /// A 200 reply carrying `responses`.
    pub fn with(responses: Vec<Response>) -> Self {
        Self {
            statuscode: 200,
            responses,
        }
    }

    /// An error reply for the envelope with id `id`.
    pub fn error(id: CorrelationId, error: &KernelError) -> Self {
        Self {
            statuscode: error.status_code(),
            responses: vec![Response::from_error(id, KERNEL_MODULE_NAME, error)],
        }
    }

    /// Fold the reply into a single stream response answering `id`.
    pub fn into_response(self, id: CorrelationId) -> Response {
        let detailedstatus = self.responses.first().and_then(|r| {
            if self.statuscode >= 400 {
                r.detailedstatus
            } else {
                None
            }
        });
        Response {
            id,
            modulename: KERNEL_MODULE_NAME.into(),
            statuscode: self.statuscode,
            detailedstatus,
            content: serde_json::to_value(self.responses).unwrap_or(Value::Array(Vec::new())),
        }
    }
}

pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_defaults_optional_fields() {
        let id = new_correlation_id();
        let raw = json!({
            "id": id,
            "modulename": "sensor",
            "eventname": "kernel/dispose",
        });

        let envelope: Envelope = serde_json::from_value(raw).expect("decode");
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.timeout, None);
        assert_eq!(envelope.payload, Value::Null);
        assert!(envelope.credential.is_none());
        assert_eq!(
            envelope.timeout_or(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn frame_distinguishes_responses_from_requests() {
        let request = Envelope::new("a", "weather/today", json!({"city": "Oslo"}));
        let line = Frame::Request(request.clone()).encode().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(Frame::decode(line.trim_end()).unwrap(), Frame::Request(request));

        let response = Response::ok(new_correlation_id(), "b", json!(42));
        let line = Frame::Response(response.clone()).encode().unwrap();
        assert_eq!(
            Frame::decode(line.trim_end()).unwrap(),
            Frame::Response(response)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Frame::decode("{not json").unwrap_err();
        assert!(matches!(err, KernelError::MalformedMessage { .. }));
    }

    #[test]
    fn no_subscriptions_shape() {
        let id = new_correlation_id();
        let value = serde_json::to_value(Response::no_subscriptions(id)).unwrap();
        assert_eq!(value["modulename"], "kernel");
        assert_eq!(value["statuscode"], 207);
        assert_eq!(value["detailedstatus"], "NO_SUBSCRIPTIONS");
        assert_eq!(value["content"], json!([]));
    }

    #[test]
    fn reply_folds_into_single_response() {
        let id = new_correlation_id();
        let inner = Response::ok(new_correlation_id(), "b", json!("pong"));
        let folded = Reply::with(vec![inner.clone()]).into_response(id);

        assert_eq!(folded.id, id);
        assert_eq!(folded.statuscode, 200);
        assert!(folded.detailedstatus.is_none());
        let content: Vec<Response> = serde_json::from_value(folded.content).unwrap();
        assert_eq!(content, vec![inner]);
    }

    #[test]
    fn error_reply_keeps_detailed_status() {
        let id = new_correlation_id();
        let err = KernelError::ModuleNotFound {
            module_id: "ghost".into(),
        };
        let folded = Reply::error(id, &err).into_response(id);
        assert_eq!(folded.statuscode, 404);
        assert_eq!(folded.detailedstatus, Some(DetailedStatus::UnknownModule));
    }
}
