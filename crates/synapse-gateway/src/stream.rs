//! Duplex-stream listener.
//!
//! Each accepted TCP connection carries exactly one module.  Both sides
//! write one JSON object per line; the kernel's calls to the module and the
//! module's requests to the kernel share the connection and are told apart
//! by correlation id (see [`StreamTransport`]).
//!
//! Control requests (`kernel/*`) from one connection are handled in arrival
//! order, so a module can send `init` then `subscribe` without waiting.
//! Dispatched events run concurrently: a module may dispatch an event that
//! is routed straight back to itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;

use synapse_kernel::envelope::{CONTROL_SHUTDOWN, KERNEL_DISPOSE};
use synapse_kernel::{
    Attachment, Envelope, KernelError, Link, ModuleDescriptor, ModuleId, ModuleTransport,
    Response, Router, StreamTransport,
};

use crate::error::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Attributes requests to the module the connection initialised.
///
/// The binding lapses once that registration leaves the router, including
/// a dispose requested through another listener, so the connection may
/// `init` again.
pub struct StreamLink {
    router: Arc<Router>,
    transport: StreamTransport,
    attached: Mutex<Option<(ModuleId, u64)>>,
}

impl StreamLink {
    pub fn new(router: Arc<Router>, transport: StreamTransport) -> Self {
        Self {
            router,
            transport,
            attached: Mutex::new(None),
        }
    }

    /// The module registered over this connection, if it is still active.
    pub fn module(&self) -> Option<ModuleId> {
        let mut slot = self.slot();
        let (id, generation) = slot.as_ref()?;
        let live = self
            .router
            .module(id)
            .is_some_and(|handle| handle.generation() == *generation);
        if live {
            return Some(id.clone());
        }
        if let Some((id, generation)) = slot.take() {
            tracing::debug!(
                peer = %self.transport.label(),
                module_id = %id,
                generation,
                "connection's module was disposed elsewhere"
            );
        }
        None
    }

    /// Forget the registered module, returning it with its generation.
    fn detach(&self) -> Option<(ModuleId, u64)> {
        self.slot().take()
    }

    fn slot(&self) -> MutexGuard<'_, Option<(ModuleId, u64)>> {
        self.attached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Link for StreamLink {
    fn caller(&self, _envelope: &Envelope) -> Option<ModuleId> {
        self.module()
    }

    fn attach(&self, module: &ModuleId, _payload: &Value) -> synapse_kernel::Result<Attachment> {
        // One connection, one module.
        if let Some(current) = self.module() {
            return Err(KernelError::ModuleAlreadyActive {
                module_id: current.to_string(),
            });
        }
        Ok(Attachment {
            transport: Arc::new(self.transport.clone()),
            address: Value::String(module.to_string()),
        })
    }

    fn attached(&self, descriptor: &ModuleDescriptor) {
        *self.slot() = Some((descriptor.module_id.clone(), descriptor.generation));
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Serve one module connection until it ends.
///
/// When the stream closes, the module registered over it (if any) is
/// released from the router.
pub async fn serve_connection<R, W>(router: Arc<Router>, label: String, reader: R, writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (transport, mut inbound) = StreamTransport::spawn(label.clone(), reader, writer);
    let link = Arc::new(StreamLink::new(Arc::clone(&router), transport.clone()));
    tracing::debug!(peer = %label, "connection opened");

    while let Some(envelope) = inbound.recv().await {
        if !is_control(&envelope.eventname) {
            let router = Arc::clone(&router);
            let link = Arc::clone(&link);
            let transport = transport.clone();
            tokio::spawn(async move {
                let id = envelope.id;
                let reply = router.handle(envelope, link.as_ref()).await;
                send_reply(&transport, reply.into_response(id)).await;
            });
            continue;
        }

        let id = envelope.id;
        let disposing = envelope.eventname == KERNEL_DISPOSE;
        let reply = router.handle(envelope, link.as_ref()).await;
        let disposed = disposing && reply.statuscode == 200;
        send_reply(&transport, reply.into_response(id)).await;

        if disposed {
            // The reply is already queued and goes out before the close.
            link.detach();
            transport.close();
        }
    }

    if let Some((module, generation)) = link.detach() {
        router.release(&module, generation);
    }
    tracing::debug!(peer = %label, "connection closed");
}

fn is_control(event: &str) -> bool {
    event.is_empty() || event.starts_with("kernel/") || event == CONTROL_SHUTDOWN
}

async fn send_reply(transport: &StreamTransport, response: Response) {
    if let Err(e) = transport.reply(response).await {
        tracing::debug!(peer = %transport.label(), error = %e, "reply not delivered");
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// TCP listener accepting one module per connection.
pub struct StreamGateway {
    listener: TcpListener,
    router: Arc<Router>,
}

impl StreamGateway {
    /// Bind the listener.  Connections are not accepted until [`serve`].
    ///
    /// [`serve`]: StreamGateway::serve
    pub async fn bind(addr: &str, router: Arc<Router>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` turns `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails; the kernel cannot
    /// take on new modules after that.
    pub async fn serve(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "stream listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = stop.wait_for(|stopped| *stopped) => break,
            };

            let (socket, peer) = accepted.map_err(|e| {
                tracing::error!(addr = %addr, error = %e, "stream listener failed to accept");
                GatewayError::Io(e)
            })?;
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let (reader, writer) = socket.into_split();
            tokio::spawn(serve_connection(
                Arc::clone(&self.router),
                peer.to_string(),
                reader,
                writer,
            ));
        }

        tracing::info!(addr = %addr, "stream listener stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    use super::*;
    use synapse_kernel::envelope::{KERNEL_INIT, KERNEL_SUBSCRIBE};
    use synapse_kernel::{DetailedStatus, Frame, LogSink};

    struct Module {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Module {
        async fn request(&mut self, envelope: Envelope) -> Response {
            let id = envelope.id;
            let line = Frame::Request(envelope).encode().unwrap();
            self.writer.write_all(line.as_bytes()).await.unwrap();
            loop {
                let line = self.lines.next_line().await.unwrap().expect("stream open");
                if let Frame::Response(response) = Frame::decode(&line).unwrap() {
                    assert_eq!(response.id, id);
                    return response;
                }
            }
        }
    }

    fn connect(router: &Arc<Router>) -> Module {
        let (kernel_side, module_side) = tokio::io::duplex(64 * 1024);
        let (kr, kw) = tokio::io::split(kernel_side);
        tokio::spawn(serve_connection(Arc::clone(router), "test".into(), kr, kw));

        let (mr, mw) = tokio::io::split(module_side);
        Module {
            lines: BufReader::new(mr).lines(),
            writer: mw,
        }
    }

    fn router() -> Arc<Router> {
        Arc::new(Router::new(Duration::from_secs(1), LogSink::new("unused.log")))
    }

    #[test]
    fn control_names() {
        assert!(is_control("kernel/subscribe"));
        assert!(is_control(CONTROL_SHUTDOWN));
        assert!(is_control(""));
        assert!(!is_control("sensor/reading"));
    }

    #[tokio::test]
    async fn subscribe_before_init_is_unknown_module() {
        let router = router();
        let mut module = connect(&router);

        let reply = module
            .request(Envelope::new("m", KERNEL_SUBSCRIBE, json!({"eventname": "e"})))
            .await;
        assert_eq!(reply.statuscode, 404);
        assert_eq!(reply.detailedstatus, Some(DetailedStatus::UnknownModule));
    }

    #[tokio::test]
    async fn one_module_per_connection() {
        let router = router();
        let mut module = connect(&router);

        let first = module.request(Envelope::new("a", KERNEL_INIT, Value::Null)).await;
        assert_eq!(first.statuscode, 200);
        assert_eq!(first.content[0]["content"], json!("a"));

        let second = module.request(Envelope::new("b", KERNEL_INIT, Value::Null)).await;
        assert_eq!(second.statuscode, 409);
        assert_eq!(router.module_ids(), vec![ModuleId::from("a")]);
    }

    #[tokio::test]
    async fn requests_are_attributed_to_the_initialised_module() {
        let router = router();
        let mut module = connect(&router);
        module.request(Envelope::new("real", KERNEL_INIT, Value::Null)).await;

        // The self-reported name is ignored once the connection is bound.
        let reply = module
            .request(Envelope::new("impostor", KERNEL_SUBSCRIBE, json!({"eventname": "e"})))
            .await;
        assert_eq!(reply.statuscode, 200);
        assert_eq!(router.subscribers("e"), vec![ModuleId::from("real")]);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_module() {
        let router = router();
        let mut module = connect(&router);
        module.request(Envelope::new("m", KERNEL_INIT, Value::Null)).await;
        module
            .request(Envelope::new("m", KERNEL_SUBSCRIBE, json!({"eventname": "e"})))
            .await;
        drop(module);

        for _ in 0..100 {
            if router.module_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(router.module_count(), 0);
        assert!(router.subscribers("e").is_empty());
    }

    #[tokio::test]
    async fn dispose_from_elsewhere_frees_the_connection() {
        let router = router();
        let mut module = connect(&router);
        module.request(Envelope::new("m", KERNEL_INIT, Value::Null)).await;

        // Another listener disposes the module by name.
        router.dispose_module(&"m".into()).unwrap();

        let orphaned = module
            .request(Envelope::new("m", KERNEL_SUBSCRIBE, json!({"eventname": "e"})))
            .await;
        assert_eq!(orphaned.statuscode, 404);

        let again = module.request(Envelope::new("m", KERNEL_INIT, Value::Null)).await;
        assert_eq!(again.statuscode, 200);

        let subscribed = module
            .request(Envelope::new("m", KERNEL_SUBSCRIBE, json!({"eventname": "e"})))
            .await;
        assert_eq!(subscribed.statuscode, 200);
        assert_eq!(router.subscribers("e"), vec![ModuleId::from("m")]);
    }
}
