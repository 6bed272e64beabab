//! HTTP framing.
//!
//! Modules send every request as `POST /<eventname>` with an envelope as
//! the JSON body; the path wins over any `eventname` in the body.  The
//! status line carries the reply's `statuscode` and the body is the array of
//! responses.
//!
//! The kernel reaches a module the same way in the other direction:
//! `kernel/init` hands the module a port (the next one after
//! `http.base_port`, unless the module names its own with
//! `{"port": <n>}`), and every later call becomes
//! `POST http://<module_host>:<port>/<eventname>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;

use synapse_kernel::config::HttpConfig;
use synapse_kernel::envelope::{duration_millis, new_correlation_id};
use synapse_kernel::{
    Attachment, CallRequest, CorrelationId, Envelope, KernelError, Link, ModuleId,
    ModuleTransport, Reply, Response, Router, TransportStats,
};

use crate::error::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// What a module may answer with: a response, a list of them, or bare
/// content.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModuleReply {
    One(Response),
    Many(Vec<Response>),
    Content(Value),
}

/// Calls one module over HTTP, one request per call.
pub struct HttpTransport {
    client: reqwest::Client,
    module: ModuleId,
    base_url: String,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    malformed: AtomicU64,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, module: ModuleId, host: &str, port: u16) -> Self {
        Self {
            client,
            module,
            base_url: format!("http://{host}:{port}"),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn exchange(&self, envelope: &Envelope, timeout: Duration) -> synapse_kernel::Result<Response> {
        let url = format!("{}/{}", self.base_url, envelope.eventname);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| self.request_error(e, &envelope.eventname, timeout))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.request_error(e, &envelope.eventname, timeout))?;

        self.decode(status, &body)
    }

    fn decode(&self, status: u16, body: &[u8]) -> synapse_kernel::Result<Response> {
        let bare = |content: Value| Response {
            id: CorrelationId::nil(),
            modulename: String::new(),
            statuscode: status,
            detailedstatus: None,
            content,
        };

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(bare(Value::Null));
        }

        match serde_json::from_slice::<ModuleReply>(body) {
            Ok(ModuleReply::One(response)) => Ok(response),
            Ok(ModuleReply::Many(mut responses)) => {
                if responses.is_empty() {
                    Ok(bare(Value::Array(Vec::new())))
                } else {
                    Ok(responses.swap_remove(0))
                }
            }
            Ok(ModuleReply::Content(content)) => Ok(bare(content)),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(module_id = %self.module, error = %e, "module answered with malformed body");
                Err(KernelError::MalformedMessage {
                    reason: format!("response from `{}`: {e}", self.module),
                })
            }
        }
    }

    fn request_error(&self, error: reqwest::Error, event: &str, timeout: Duration) -> KernelError {
        if error.is_timeout() {
            KernelError::Timeout {
                event: event.to_owned(),
                timeout_ms: duration_millis(timeout),
            }
        } else if error.is_connect() {
            // Nobody listens on the module's port any more.
            if !self.closed.swap(true, Ordering::AcqRel) {
                tracing::info!(module_id = %self.module, url = %self.base_url, error = %error, "module unreachable");
            }
            KernelError::TransportClosed {
                module: self.module.to_string(),
            }
        } else {
            KernelError::Internal(format!("http call to `{}` failed: {error}", self.module))
        }
    }
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ModuleTransport for HttpTransport {
    async fn call(&self, request: CallRequest) -> synapse_kernel::Result<Response> {
        if self.is_closed() {
            return Err(KernelError::TransportClosed {
                module: self.module.to_string(),
            });
        }

        let timeout = request.timeout;
        let envelope = request.into_envelope();
        let id = envelope.id;

        let result = {
            let _in_flight = InFlight::enter(&self.in_flight);
            self.exchange(&envelope, timeout).await
        };

        let mut response = result?;
        if response.id.is_nil() {
            response.id = id;
        }
        Ok(response)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn kind(&self) -> &'static str {
        "http"
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            pending: self.in_flight.load(Ordering::Relaxed),
            stale_responses: 0,
            malformed_frames: self.malformed.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Attributes requests by their `modulename` and hands out callback ports.
pub struct HttpLink {
    client: reqwest::Client,
    module_host: String,
    last_port: AtomicU16,
}

impl HttpLink {
    /// Ports are allocated starting at `base_port + 1`.
    pub fn new(module_host: impl Into<String>, base_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("synapse/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            module_host: module_host.into(),
            last_port: AtomicU16::new(base_port),
        }
    }

    pub fn from_config(config: &HttpConfig) -> Self {
        Self::new(config.module_host.clone(), config.base_port)
    }

    fn allocate_port(&self) -> synapse_kernel::Result<u16> {
        self.last_port
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |port| port.checked_add(1))
            .map(|previous| previous + 1)
            .map_err(|_| KernelError::Internal("module port range exhausted".into()))
    }
}

fn requested_port(payload: &Value) -> Option<u16> {
    payload
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
}

impl Link for HttpLink {
    fn caller(&self, envelope: &Envelope) -> Option<ModuleId> {
        (!envelope.modulename.is_empty()).then(|| ModuleId::from(envelope.modulename.as_str()))
    }

    fn attach(&self, module: &ModuleId, payload: &Value) -> synapse_kernel::Result<Attachment> {
        let port = match requested_port(payload) {
            Some(port) => port,
            None => self.allocate_port()?,
        };
        let transport = HttpTransport::new(self.client.clone(), module.clone(), &self.module_host, port);
        tracing::debug!(module_id = %module, url = %transport.base_url(), "module callback address assigned");

        Ok(Attachment {
            transport: Arc::new(transport),
            address: json!(port),
        })
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HttpState {
    router: Arc<Router>,
    link: Arc<HttpLink>,
}

/// Build the Axum router serving module requests.
pub fn app(router: Arc<Router>, link: HttpLink) -> axum::Router {
    axum::Router::new()
        .route("/{*event}", post(handle_event))
        .with_state(HttpState {
            router,
            link: Arc::new(link),
        })
}

async fn handle_event(
    State(state): State<HttpState>,
    Path(event): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<Vec<Response>>) {
    let reply = match parse_envelope(&event, &body) {
        Ok(envelope) => state.router.handle(envelope, state.link.as_ref()).await,
        Err(e) => {
            tracing::debug!(event = %event, error = %e, "rejecting request body");
            Reply::error(CorrelationId::nil(), &e)
        }
    };

    let status = StatusCode::from_u16(reply.statuscode).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.responses))
}

/// Decode a request body, taking the event name from the path.
///
/// An empty body or a missing `id` is tolerated; the kernel assigns one.
fn parse_envelope(event: &str, body: &[u8]) -> synapse_kernel::Result<Envelope> {
    let malformed = |reason: String| KernelError::MalformedMessage { reason };

    let mut value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice::<Value>(body).map_err(|e| malformed(e.to_string()))?
    };

    let Some(fields) = value.as_object_mut() else {
        return Err(malformed("request body must be a JSON object".into()));
    };
    fields
        .entry("id")
        .or_insert_with(|| json!(new_correlation_id()));
    fields.insert("eventname".into(), Value::String(event.to_owned()));

    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}

/// HTTP listener for modules using request/reply framing.
pub struct HttpGateway {
    listener: TcpListener,
    app: axum::Router,
}

impl HttpGateway {
    pub async fn bind(addr: &str, router: Arc<Router>, link: HttpLink) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(Self {
            listener,
            app: app(router, link),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `stop` turns `true`, then finish in-flight
    /// requests and return.
    pub async fn serve(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "http listener started");

        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            })
            .await?;

        tracing::info!(addr = %addr, "http listener stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
