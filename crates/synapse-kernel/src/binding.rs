//! Multicast event bindings.
//!
//! A [`Delegate`] is the ordered set of modules subscribed to one event
//! name.  Subscribers are stored by [`ModuleId`], never by callable, so
//! "is this module already bound?" is a plain membership check and binding
//! the same module twice is a no-op.
//!
//! Invocation works on a snapshot: the router copies the delegate's targets
//! under its lock, resolves each id to a [`ModuleHandle`], releases the lock
//! and only then calls [`invoke_async`].  Subscriptions that change while a
//! fan-out is in flight affect the next dispatch, not the current one.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::envelope::{CorrelationId, ModuleId, Response, duration_millis};
use crate::error::KernelError;
use crate::module::ModuleHandle;
use crate::transport::CallRequest;

/// Extra time granted to a transport beyond the call's own timeout before
/// the fan-out stops waiting on it.
const TIMEOUT_GRACE: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Delegate
// ---------------------------------------------------------------------------

/// Subscribers of one event, in the order they were bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delegate {
    targets: Vec<ModuleId>,
}

impl Delegate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `module` unless it is already bound.
    ///
    /// Returns `true` if the module was added.
    pub fn bind(&mut self, module: &ModuleId) -> bool {
        if self.contains(module) {
            return false;
        }
        self.targets.push(module.clone());
        true
    }

    /// Remove `module`, preserving the order of the remaining targets.
    ///
    /// Returns `true` if the module was bound.
    pub fn unbind(&mut self, module: &ModuleId) -> bool {
        match self.targets.iter().position(|t| t == module) {
            Some(index) => {
                self.targets.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, module: &ModuleId) -> bool {
        self.targets.iter().any(|t| t == module)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// The bound modules in bind order.
    pub fn targets(&self) -> &[ModuleId] {
        &self.targets
    }

    /// Copy the target list for an invocation.
    pub fn snapshot(&self) -> Vec<ModuleId> {
        self.targets.clone()
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// One subscriber resolved for an invocation.
///
/// `handle` is `None` when the module left the registry between the
/// snapshot and resolution.
#[derive(Debug, Clone)]
pub struct Target {
    pub module: ModuleId,
    pub handle: Option<Arc<ModuleHandle>>,
}

/// Call every target concurrently and collect their responses in target
/// order.
///
/// Every entry is addressed to `reply_id`.  A target that fails (timeout,
/// closed transport, missing handle) contributes an error-coded
/// [`Response`] instead of failing the whole fan-out.
pub async fn invoke_async(
    targets: Vec<Target>,
    request: &CallRequest,
    reply_id: CorrelationId,
) -> Vec<Response> {
    let calls = targets
        .into_iter()
        .map(|target| call_target(target, request.clone(), reply_id));
    join_all(calls).await
}

async fn call_target(target: Target, request: CallRequest, reply_id: CorrelationId) -> Response {
    let Some(handle) = target.handle else {
        let err = KernelError::TransportClosed {
            module: target.module.to_string(),
        };
        tracing::debug!(module_id = %target.module, "subscriber vanished before invocation");
        return Response::from_error(reply_id, target.module.as_str(), &err);
    };

    let event = request.eventname.clone();
    let timeout = request.timeout;
    let outcome = match tokio::time::timeout(timeout + TIMEOUT_GRACE, handle.transport().call(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(KernelError::Timeout {
            event: event.clone(),
            timeout_ms: duration_millis(timeout),
        }),
    };

    match outcome {
        Ok(mut response) => {
            response.id = reply_id;
            if response.modulename.is_empty() {
                response.modulename = target.module.to_string();
            }
            response
        }
        Err(e) => {
            tracing::warn!(
                module_id = %target.module,
                event = %event,
                error = %e,
                "subscriber call failed"
            );
            Response::from_error(reply_id, target.module.as_str(), &e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
