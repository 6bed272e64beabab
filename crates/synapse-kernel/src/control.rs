//! Control routing for inbound envelopes.
//!
//! Every inbound envelope, whatever its framing, goes through
//! [`Router::handle`].  Reserved names (`kernel/subscribe`,
//! `kernel/unsubscribe`, `kernel/init`, `kernel/dispose`, `kernel/log`) are
//! intercepted and turned into registry operations; every other name is
//! dispatched to its subscribers.
//!
//! The framing-specific parts -- who is calling, and how the kernel will
//! reach a module after `init` -- are supplied by a [`Link`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::envelope::{
    CONTROL_SHUTDOWN, Envelope, KERNEL_DISPOSE, KERNEL_INIT, KERNEL_LOG, KERNEL_MODULE_NAME,
    KERNEL_SUBSCRIBE, KERNEL_UNSUBSCRIBE, LogMessage, ModuleId, Reply, Response,
    SubscriptionChange,
};
use crate::error::{KernelError, Result};
use crate::module::ModuleDescriptor;
use crate::router::Router;
use crate::transport::ModuleTransport;

/// How a module reaches the kernel, and how the kernel reaches it back.
pub trait Link: Send + Sync {
    /// The module a request arriving on this link is attributed to, if known.
    fn caller(&self, envelope: &Envelope) -> Option<ModuleId>;

    /// Produce the transport for a module that is initialising.
    fn attach(&self, module: &ModuleId, payload: &Value) -> Result<Attachment>;

    /// Called once `init` has registered the module.
    fn attached(&self, _descriptor: &ModuleDescriptor) {}
}

/// A transport ready to be registered, plus the address reported to the
/// module.
pub struct Attachment {
    pub transport: Arc<dyn ModuleTransport>,
    pub address: Value,
}

impl Router {
    /// Handle one inbound envelope and produce the reply for its sender.
    pub async fn handle(&self, envelope: Envelope, link: &dyn Link) -> Reply {
        let id = envelope.id;
        if self.is_closing() {
            return Reply::error(id, &KernelError::ShuttingDown);
        }

        let result = match envelope.eventname.as_str() {
            KERNEL_SUBSCRIBE => self.handle_subscription(&envelope, link, true),
            KERNEL_UNSUBSCRIBE => self.handle_subscription(&envelope, link, false),
            KERNEL_INIT => self.handle_init(&envelope, link),
            KERNEL_DISPOSE => self.handle_dispose(&envelope, link),
            KERNEL_LOG => self.handle_log(&envelope).await,
            CONTROL_SHUTDOWN => Err(KernelError::ReservedEvent {
                event: CONTROL_SHUTDOWN.into(),
            }),
            "" => Err(KernelError::MalformedMessage {
                reason: "missing eventname".into(),
            }),
            event => Ok(Reply::with(self.dispatch(event, &envelope).await)),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!(
                correlation_id = %id,
                event = %envelope.eventname,
                module = %envelope.modulename,
                error = %e,
                "request rejected"
            );
            Reply::error(id, &e)
        })
    }

    fn handle_subscription(&self, envelope: &Envelope, link: &dyn Link, subscribe: bool) -> Result<Reply> {
        let change: SubscriptionChange = decode_payload(envelope)?;
        let module = require_caller(envelope, link)?;

        // Already-bound and not-bound are informational only.
        if subscribe {
            self.subscribe(&module, &change.eventname)?;
        } else {
            self.unsubscribe(&module, &change.eventname)?;
        }
        Ok(Reply::ok())
    }

    fn handle_init(&self, envelope: &Envelope, link: &dyn Link) -> Result<Reply> {
        let module = ModuleId::from(envelope.modulename.as_str());
        if module.as_str().is_empty() {
            return Err(KernelError::MalformedMessage {
                reason: "kernel/init requires a modulename".into(),
            });
        }

        let attachment = link.attach(&module, &envelope.payload)?;
        let descriptor = self.init_module(module, attachment.transport, attachment.address)?;
        link.attached(&descriptor);

        Ok(Reply::with(vec![Response::ok(
            envelope.id,
            KERNEL_MODULE_NAME,
            descriptor.address,
        )]))
    }

    fn handle_dispose(&self, envelope: &Envelope, link: &dyn Link) -> Result<Reply> {
        let module = require_caller(envelope, link)?;
        self.dispose_module(&module)?;
        Ok(Reply::ok())
    }

    async fn handle_log(&self, envelope: &Envelope) -> Result<Reply> {
        let entry: LogMessage = decode_payload(envelope)?;
        self.sink.append(&entry.message).await?;
        Ok(Reply::ok())
    }
}

fn require_caller(envelope: &Envelope, link: &dyn Link) -> Result<ModuleId> {
    link.caller(envelope).ok_or_else(|| KernelError::ModuleNotFound {
        module_id: envelope.modulename.clone(),
    })
}

fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| KernelError::MalformedMessage {
        reason: format!("{} payload: {e}", envelope.eventname),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
