//! Newline-delimited JSON transport over a duplex byte stream.
//!
//! One [`StreamTransport`] owns one ordered, reliable stream to one module
//! (a TCP socket, a secured channel, or an in-memory pipe in tests).  Two
//! background tasks service it:
//!
//! - the **reader** splits the stream into lines, resolves pending calls
//!   from inbound [`Response`]s and forwards inbound [`Envelope`]s (the
//!   module's own requests) to the channel returned by
//!   [`StreamTransport::spawn`];
//! - the **writer** is the only task that touches the write half, so frames
//!   are never interleaved.
//!
//! When either side hits end-of-stream or an I/O error the transport closes:
//! every pending call fails with [`KernelError::TransportClosed`] and later
//! calls fail immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};

use super::{CallRequest, ModuleTransport, TransportStats};
use crate::envelope::{CorrelationId, Envelope, Frame, Response, duration_millis};
use crate::error::{KernelError, Result};

/// Frames queued for the writer before callers start waiting.
const OUTBOUND_CAPACITY: usize = 256;

/// Correlated request/response channel over a line-framed duplex stream.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<Inner>,
}

struct Inner {
    /// Human-readable peer label used in logs.
    label: String,

    /// Calls waiting for a response, keyed by correlation id.
    pending: DashMap<CorrelationId, oneshot::Sender<Response>>,

    /// Queue drained by the writer task.
    outbound: mpsc::Sender<Frame>,

    /// Flips to `true` exactly once when the stream ends.
    closed: watch::Sender<bool>,

    stale_responses: AtomicU64,
    malformed_frames: AtomicU64,
}

impl StreamTransport {
    /// Wrap a split stream and spawn its reader and writer tasks.
    ///
    /// Returns the transport together with the receiver of requests the
    /// module sends to the kernel over the same stream.  The receiver yields
    /// `None` once the stream has ended.
    pub fn spawn<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            label: label.into(),
            pending: DashMap::new(),
            outbound: outbound_tx,
            closed,
            stale_responses: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
        });

        tokio::spawn(read_loop(Arc::clone(&inner), reader, inbound_tx));
        tokio::spawn(write_loop(Arc::clone(&inner), writer, outbound_rx));

        tracing::debug!(transport = %inner.label, "stream transport started");

        (Self { inner }, inbound_rx)
    }

    /// Send a response to a request the module made over this stream.
    pub async fn reply(&self, response: Response) -> Result<()> {
        if self.inner.is_closed() {
            return Err(self.inner.closed_error());
        }
        self.inner
            .outbound
            .send(Frame::Response(response))
            .await
            .map_err(|_| self.inner.closed_error())
    }

    /// Resolve once the stream has ended.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// The peer label given at construction.
    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

#[async_trait]
impl ModuleTransport for StreamTransport {
    async fn call(&self, request: CallRequest) -> Result<Response> {
        let inner = &self.inner;
        if inner.is_closed() {
            inner.shutdown();
            return Err(inner.closed_error());
        }

        let timeout = request.timeout;
        let event = request.eventname.clone();
        let envelope = request.into_envelope();
        let id = envelope.id;

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        // Frees the slot however this call ends, including when the caller
        // drops the future mid-flight.
        let _slot = PendingSlot {
            inner: inner.as_ref(),
            id,
        };

        // A close racing with the insert above may already have drained the
        // table; never wait on a slot nobody will resolve.
        if inner.is_closed() {
            return Err(inner.closed_error());
        }

        tracing::trace!(transport = %inner.label, correlation_id = %id, event = %event, "call sent");

        let exchange = async {
            if inner.outbound.send(Frame::Request(envelope)).await.is_err() {
                inner.shutdown();
                return Err(inner.closed_error());
            }
            rx.await.map_err(|_| inner.closed_error())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    transport = %inner.label,
                    correlation_id = %id,
                    event = %event,
                    "call timed out"
                );
                Err(KernelError::Timeout {
                    event,
                    timeout_ms: duration_millis(timeout),
                })
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn close(&self) {
        self.inner.shutdown();
    }

    fn kind(&self) -> &'static str {
        "stream"
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            pending: self.inner.pending.len(),
            stale_responses: self.inner.stale_responses.load(Ordering::Relaxed),
            malformed_frames: self.inner.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

/// Removes a call's pending entry when dropped.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: CorrelationId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_error(&self) -> KernelError {
        KernelError::TransportClosed {
            module: self.label.clone(),
        }
    }

    /// Mark the stream closed and fail every pending call.  Idempotent.
    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let outstanding = self.pending.len();
        // Dropping the senders wakes every waiter with a `RecvError`.
        self.pending.clear();
        tracing::debug!(
            transport = %self.label,
            outstanding,
            "stream transport closed"
        );
    }

    fn handle_line(&self, line: &str, inbound: &mpsc::UnboundedSender<Envelope>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match Frame::decode(line) {
            Ok(Frame::Response(response)) => self.resolve(response),
            Ok(Frame::Request(envelope)) => {
                if inbound.send(envelope).is_err() {
                    tracing::debug!(transport = %self.label, "inbound request dropped, no consumer");
                }
            }
            Err(e) => {
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(transport = %self.label, error = %e, "discarding malformed frame");
            }
        }
    }

    fn resolve(&self, response: Response) {
        match self.pending.remove(&response.id) {
            Some((id, tx)) => {
                if tx.send(response).is_err() {
                    tracing::trace!(transport = %self.label, correlation_id = %id, "caller gave up before response");
                }
            }
            None => {
                self.stale_responses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    transport = %self.label,
                    correlation_id = %response.id,
                    "dropping response with no pending call"
                );
            }
        }
    }
}

async fn read_loop<R>(inner: Arc<Inner>, reader: R, inbound: mpsc::UnboundedSender<Envelope>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let mut closed = inner.closed.subscribe();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = closed.wait_for(|c| *c) => break,
        };

        match line {
            Ok(Some(line)) => inner.handle_line(&line, &inbound),
            Ok(None) => {
                tracing::debug!(transport = %inner.label, "peer closed stream");
                break;
            }
            Err(e) => {
                tracing::warn!(transport = %inner.label, error = %e, "stream read failed");
                break;
            }
        }
    }

    inner.shutdown();
}

async fn write_loop<W>(inner: Arc<Inner>, mut writer: W, mut outbound: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut closed = inner.closed.subscribe();

    loop {
        // Queued frames go out before a close is honoured, so a reply queued
        // just before `close()` still reaches the module.
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = closed.wait_for(|c| *c) => None,
        };
        let Some(frame) = frame else {
            break;
        };

        let line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(transport = %inner.label, error = %e, "failed to encode frame");
                continue;
            }
        };

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(transport = %inner.label, error = %e, "stream write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(transport = %inner.label, error = %e, "stream flush failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
    inner.shutdown();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    use super::*;
    use crate::envelope::new_correlation_id;

    type ModuleReader = Lines<BufReader<ReadHalf<DuplexStream>>>;

    struct FakeModule {
        lines: ModuleReader,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeModule {
        async fn next_request(&mut self) -> Envelope {
            let line = self
                .lines
                .next_line()
                .await
                .expect("read")
                .expect("stream open");
            match Frame::decode(&line).expect("decode") {
                Frame::Request(envelope) => envelope,
                other => panic!("expected request, got {other:?}"),
            }
        }

        async fn send(&mut self, frame: Frame) {
            let line = frame.encode().unwrap();
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    fn pair() -> (StreamTransport, mpsc::UnboundedReceiver<Envelope>, FakeModule) {
        let (kernel_side, module_side) = tokio::io::duplex(64 * 1024);
        let (kr, kw) = tokio::io::split(kernel_side);
        let (transport, inbound) = StreamTransport::spawn("test-module", kr, kw);

        let (mr, mw) = tokio::io::split(module_side);
        let module = FakeModule {
            lines: BufReader::new(mr).lines(),
            writer: mw,
        };
        (transport, inbound, module)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        let (transport, _inbound, mut module) = pair();

        let call = tokio::spawn({
            let transport = transport.clone();
            async move {
                transport
                    .call(CallRequest::new("echo", json!("hi"), Duration::from_secs(2)))
                    .await
            }
        });

        let request = module.next_request().await;
        assert_eq!(request.eventname, "echo");
        assert_eq!(request.modulename, "kernel");
        assert_eq!(request.timeout, Some(2000));
        module
            .send(Frame::Response(Response::ok(request.id, "echo-mod", request.payload)))
            .await;

        let response = call.await.unwrap().expect("call should succeed");
        assert_eq!(response.id, request.id);
        assert_eq!(response.content, json!("hi"));
        assert_eq!(transport.stats().pending, 0);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_out_of_order() {
        let (transport, _inbound, mut module) = pair();

        let first = tokio::spawn({
            let t = transport.clone();
            async move { t.call(CallRequest::new("first", json!(1), Duration::from_secs(2))).await }
        });
        let second = tokio::spawn({
            let t = transport.clone();
            async move { t.call(CallRequest::new("second", json!(2), Duration::from_secs(2))).await }
        });

        let a = module.next_request().await;
        let b = module.next_request().await;
        assert_ne!(a.id, b.id, "every call gets its own correlation id");

        // Answer in reverse send order.
        module
            .send(Frame::Response(Response::ok(b.id, "m", b.payload.clone())))
            .await;
        module
            .send(Frame::Response(Response::ok(a.id, "m", a.payload.clone())))
            .await;

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.content, json!(1));
        assert_eq!(second.content, json!(2));
    }

    #[tokio::test]
    async fn timeout_frees_slot_without_closing() {
        let (transport, _inbound, mut module) = pair();

        let result = transport
            .call(CallRequest::new("silent", json!(null), Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(KernelError::Timeout { timeout_ms: 50, .. })));
        assert_eq!(transport.stats().pending, 0);
        assert!(!transport.is_closed());

        // The late answer is dropped and counted, not delivered anywhere.
        let late = module.next_request().await;
        module
            .send(Frame::Response(Response::ok(late.id, "m", json!("late"))))
            .await;
        eventually(|| transport.stats().stale_responses == 1).await;
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn abandoned_call_frees_its_slot() {
        let (transport, _inbound, mut module) = pair();

        let call = tokio::spawn({
            let t = transport.clone();
            async move { t.call(CallRequest::new("slow", json!(null), Duration::from_secs(60))).await }
        });

        let request = module.next_request().await;
        assert_eq!(transport.stats().pending, 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(transport.stats().pending, 0);
        assert!(!transport.is_closed());

        // The answer that arrives afterwards has nowhere to go.
        module
            .send(Frame::Response(Response::ok(request.id, "m", json!("late"))))
            .await;
        eventually(|| transport.stats().stale_responses == 1).await;
    }

    #[tokio::test]
    async fn foreign_response_is_dropped() {
        let (transport, _inbound, mut module) = pair();
        module
            .send(Frame::Response(Response::ok(new_correlation_id(), "m", json!(0))))
            .await;
        eventually(|| transport.stats().stale_responses == 1).await;
    }

    #[tokio::test]
    async fn malformed_frame_is_not_fatal() {
        let (transport, _inbound, mut module) = pair();
        module.send_raw("this is not json\n").await;
        eventually(|| transport.stats().malformed_frames == 1).await;

        let call = tokio::spawn({
            let t = transport.clone();
            async move { t.call(CallRequest::new("after", json!(null), Duration::from_secs(2))).await }
        });
        let request = module.next_request().await;
        module
            .send(Frame::Response(Response::ok(request.id, "m", json!("fine"))))
            .await;
        assert_eq!(call.await.unwrap().unwrap().content, json!("fine"));
    }

    #[tokio::test]
    async fn stream_end_rejects_pending_calls() {
        let (transport, mut inbound, mut module) = pair();

        let call = tokio::spawn({
            let t = transport.clone();
            async move { t.call(CallRequest::new("doomed", json!(null), Duration::from_secs(5))).await }
        });
        let _ = module.next_request().await;
        drop(module);

        let result = call.await.unwrap();
        assert!(matches!(result, Err(KernelError::TransportClosed { .. })));
        transport.closed().await;
        assert!(transport.is_closed());
        assert!(inbound.recv().await.is_none());

        // Later calls fail immediately.
        let again = transport
            .call(CallRequest::new("again", json!(null), Duration::from_secs(5)))
            .await;
        assert!(matches!(again, Err(KernelError::TransportClosed { .. })));
    }

    #[tokio::test]
    async fn inbound_requests_are_forwarded_and_answered() {
        let (transport, mut inbound, mut module) = pair();

        let request = Envelope::new("sensor", "kernel/subscribe", json!({"eventname": "t"}));
        module.send(Frame::Request(request.clone())).await;

        let received = inbound.recv().await.expect("forwarded");
        assert_eq!(received, request);

        transport
            .reply(Response::ok(received.id, "kernel", json!([])))
            .await
            .unwrap();
        let line = module.lines.next_line().await.unwrap().unwrap();
        match Frame::decode(&line).unwrap() {
            Frame::Response(r) => assert_eq!(r.id, request.id),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls() {
        let (transport, _inbound, mut module) = pair();

        let call = tokio::spawn({
            let t = transport.clone();
            async move { t.call(CallRequest::new("pending", json!(null), Duration::from_secs(5))).await }
        });
        let _ = module.next_request().await;
        transport.close();

        assert!(matches!(
            call.await.unwrap(),
            Err(KernelError::TransportClosed { .. })
        ));
        // The module sees end-of-stream.
        assert!(module.lines.next_line().await.unwrap().is_none());
    }
}
