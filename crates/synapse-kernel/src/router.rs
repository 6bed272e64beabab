//! Event router.
//!
//! The [`Router`] owns the kernel's only shared mutable state:
//!
//! - the **binding map**: event name -> [`Delegate`] (ordered subscribers),
//! - the **module map**: [`ModuleId`] -> [`ModuleHandle`].
//!
//! Both maps are [`DashMap`]s so the hot read path (dispatch snapshots,
//! handle lookups) never blocks behind a global lock.  Every *mutation*
//! (subscribe, unsubscribe, init, dispose, release, clear) additionally
//! holds a single writer mutex, so lifecycle changes and subscription
//! changes can never interleave: a subscription can't be created for a
//! module that is being disposed, and a disposed module can't leave a stale
//! entry behind.  The writer mutex is never held across an `.await`; the
//! remote calls of a fan-out run with no lock held at all.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::binding::{Delegate, Target, invoke_async};
use crate::config::KernelConfig;
use crate::envelope::{DetailedStatus, Envelope, ModuleId, Response};
use crate::error::{KernelError, Result};
use crate::module::{ModuleDescriptor, ModuleHandle, ModuleState};
use crate::sink::LogSink;
use crate::transport::{CallRequest, ModuleTransport};

/// Registry of modules and event bindings, and the kernel's five control
/// operations over them.
pub struct Router {
    bindings: DashMap<String, Delegate>,
    modules: DashMap<ModuleId, Arc<ModuleHandle>>,

    /// Serializes every mutation of `bindings` and `modules`.
    writer: Mutex<()>,

    next_generation: AtomicU64,
    closing: AtomicBool,

    default_timeout: Duration,
    pub(crate) sink: LogSink,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new(default_timeout: Duration, sink: LogSink) -> Self {
        Self {
            bindings: DashMap::new(),
            modules: DashMap::new(),
            writer: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            default_timeout,
            sink,
        }
    }

    /// Create a router from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(
            config.default_timeout(),
            LogSink::new(config.kernel.log_path.clone()),
        )
    }

    /// Timeout applied to envelopes that carry none.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // -- Subscriptions ------------------------------------------------------

    /// Bind `module` to `event`, creating the binding on first use.
    ///
    /// Returns `Ok(false)` if the module was already subscribed.
    pub fn subscribe(&self, module: &ModuleId, event: &str) -> Result<bool> {
        validate_event_name(event)?;
        let _writer = self.lock_writer();

        if !self.modules.contains_key(module) {
            return Err(KernelError::ModuleNotFound {
                module_id: module.to_string(),
            });
        }

        let added = self.bindings.entry(event.to_owned()).or_default().bind(module);
        if added {
            tracing::info!(module_id = %module, event = %event, "module subscribed");
        } else {
            tracing::info!(module_id = %module, event = %event, "module already subscribed");
        }
        Ok(added)
    }

    /// Remove `module` from `event`'s subscribers.
    ///
    /// Returns `Ok(false)` if it was not subscribed.
    pub fn unsubscribe(&self, module: &ModuleId, event: &str) -> Result<bool> {
        validate_event_name(event)?;
        let _writer = self.lock_writer();

        let removed = self
            .bindings
            .get_mut(event)
            .map(|mut delegate| delegate.unbind(module))
            .unwrap_or(false);

        if removed {
            tracing::info!(module_id = %module, event = %event, "module unsubscribed");
        } else {
            tracing::info!(module_id = %module, event = %event, "module was not subscribed");
        }
        Ok(removed)
    }

    // -- Dispatch -----------------------------------------------------------

    /// Deliver `envelope` to every subscriber of `event`.
    ///
    /// Results are returned in bind order.  With no subscribers the result
    /// is a single 207 `NO_SUBSCRIPTIONS` response from the kernel.
    pub async fn dispatch(&self, event: &str, envelope: &Envelope) -> Vec<Response> {
        let snapshot = match self.bindings.get(event) {
            Some(delegate) if !delegate.is_empty() => delegate.snapshot(),
            _ => {
                tracing::debug!(event = %event, "dispatch with no subscribers");
                return vec![Response::no_subscriptions(envelope.id)];
            }
        };

        let targets: Vec<Target> = snapshot
            .into_iter()
            .map(|module| {
                let handle = self.module(&module);
                Target { module, handle }
            })
            .collect();
        let handles: Vec<Option<Arc<ModuleHandle>>> =
            targets.iter().map(|t| t.handle.clone()).collect();

        let mut request = CallRequest::forward(envelope, self.default_timeout);
        request.eventname = event.to_owned();

        tracing::debug!(
            event = %event,
            origin = %envelope.modulename,
            subscribers = targets.len(),
            "dispatching event"
        );

        let responses = invoke_async(targets, &request, envelope.id).await;

        // A subscriber whose connection is gone ends its own lifecycle only.
        for (handle, response) in handles.iter().zip(&responses) {
            let Some(handle) = handle else { continue };
            if response.detailedstatus == Some(DetailedStatus::TransportClosed)
                && handle.transport().is_closed()
            {
                self.release(handle.id(), handle.generation());
            }
        }

        responses
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Register a new active module reached through `transport`.
    ///
    /// `address` is echoed back in the descriptor so the module learns how
    /// the kernel will reach it.
    pub fn init_module(
        &self,
        id: ModuleId,
        transport: Arc<dyn ModuleTransport>,
        address: Value,
    ) -> Result<ModuleDescriptor> {
        if id.as_str().is_empty() {
            return Err(KernelError::MalformedMessage {
                reason: "module name must not be empty".into(),
            });
        }

        let _writer = self.lock_writer();
        if self.is_closing() {
            return Err(KernelError::ShuttingDown);
        }
        if self.modules.contains_key(&id) {
            return Err(KernelError::ModuleAlreadyActive {
                module_id: id.to_string(),
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ModuleHandle::new(id.clone(), generation, transport));
        tracing::info!(
            module_id = %id,
            generation,
            transport = handle.transport().kind(),
            "module initialized"
        );
        self.modules.insert(id.clone(), handle);

        Ok(ModuleDescriptor {
            module_id: id,
            generation,
            address,
        })
    }

    /// Remove `module` from every binding and from the registry.
    ///
    /// Returns the events it was unsubscribed from.
    pub fn dispose_module(&self, module: &ModuleId) -> Result<Vec<String>> {
        let _writer = self.lock_writer();
        let Some((_, handle)) = self.modules.remove(module) else {
            return Err(KernelError::ModuleNotFound {
                module_id: module.to_string(),
            });
        };
        Ok(self.retire(&handle))
    }

    /// Dispose `module` only if its registered handle is still `generation`.
    ///
    /// Used when a transport is lost: a module that already re-registered
    /// under the same name must not be torn down by its old connection.
    pub fn release(&self, module: &ModuleId, generation: u64) -> bool {
        let _writer = self.lock_writer();
        match self
            .modules
            .remove_if(module, |_, handle| handle.generation() == generation)
        {
            Some((_, handle)) => {
                tracing::info!(module_id = %module, generation, "releasing module after transport loss");
                self.retire(&handle);
                true
            }
            None => false,
        }
    }

    /// Unbind a removed handle everywhere and mark it disposed.
    ///
    /// Caller must hold the writer lock.
    fn retire(&self, handle: &ModuleHandle) -> Vec<String> {
        let module = handle.id();
        let mut unsubscribed = Vec::new();
        for mut entry in self.bindings.iter_mut() {
            if entry.value_mut().unbind(module) {
                tracing::info!(module_id = %module, event = %entry.key(), "module unsubscribed");
                unsubscribed.push(entry.key().clone());
            }
        }
        handle.mark_disposed();
        tracing::info!(
            module_id = %module,
            generation = handle.generation(),
            subscriptions = unsubscribed.len(),
            "module disposed"
        );
        unsubscribed
    }

    // -- Shutdown support ---------------------------------------------------

    /// Stop accepting new work.  Returns `false` if already closing.
    pub fn begin_shutdown(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Drop every binding and dispose every module, closing their
    /// transports.  Returns the number of modules disposed.
    pub fn clear(&self) -> usize {
        let _writer = self.lock_writer();
        self.bindings.clear();

        let ids: Vec<ModuleId> = self.modules.iter().map(|e| e.key().clone()).collect();
        let mut disposed = 0;
        for id in ids {
            if let Some((_, handle)) = self.modules.remove(&id) {
                handle.mark_disposed();
                handle.transport().close();
                disposed += 1;
            }
        }
        tracing::info!(modules = disposed, "router registries cleared");
        disposed
    }

    // -- Introspection ------------------------------------------------------

    /// The active handle registered under `module`, if any.
    pub fn module(&self, module: &ModuleId) -> Option<Arc<ModuleHandle>> {
        self.modules.get(module).map(|e| Arc::clone(e.value()))
    }

    /// `Active` if `module` has a registered handle, `Uninitialized`
    /// otherwise.  A handle's own [`ModuleHandle::state`] reports `Disposed`
    /// once it has been removed.
    pub fn module_state(&self, module: &ModuleId) -> ModuleState {
        self.module(module)
            .map(|h| h.state())
            .unwrap_or(ModuleState::Uninitialized)
    }

    /// Snapshot of every active handle.
    pub fn modules(&self) -> Vec<Arc<ModuleHandle>> {
        self.modules.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.modules.iter().map(|e| e.key().clone()).collect()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Subscribers of `event` in bind order.
    pub fn subscribers(&self, event: &str) -> Vec<ModuleId> {
        self.bindings
            .get(event)
            .map(|d| d.snapshot())
            .unwrap_or_default()
    }

    /// Number of event names that have a binding (possibly empty).
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`; a poisoned lock carries no broken state.
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_event_name(event: &str) -> Result<()> {
    if event.is_empty() {
        return Err(KernelError::MalformedMessage {
            reason: "event name must not be empty".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::envelope::new_correlation_id;
    use crate::transport::TransportStats;

    /// Replies immediately with the module's own name.
    struct Echo {
        name: String,
        closed: AtomicBool,
    }

    impl Echo {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ModuleTransport for Echo {
        async fn call(&self, _request: CallRequest) -> Result<Response> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(KernelError::TransportClosed {
                    module: self.name.clone(),
                });
            }
            Ok(Response::ok(new_correlation_id(), self.name.clone(), json!(self.name)))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn kind(&self) -> &'static str {
            "echo"
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn router() -> Router {
        Router::new(Duration::from_secs(1), LogSink::new("unused.log"))
    }

    fn init(router: &Router, name: &str) -> Arc<Echo> {
        let transport = Echo::new(name);
        router
            .init_module(name.into(), transport.clone(), Value::Null)
            .expect("init");
        transport
    }

    fn envelope(event: &str) -> Envelope {
        Envelope::new("publisher", event, json!({"n": 1}))
    }

    #[test]
    fn subscribe_twice_binds_once() {
        let router = router();
        init(&router, "m");
        let m = ModuleId::from("m");

        assert!(router.subscribe(&m, "e").unwrap());
        assert!(!router.subscribe(&m, "e").unwrap());
        assert_eq!(router.subscribers("e"), vec![m]);
    }

    #[test]
    fn unsubscribe_without_subscription_is_false() {
        let router = router();
        init(&router, "a");
        init(&router, "b");
        router.subscribe(&"a".into(), "e").unwrap();

        assert!(!router.unsubscribe(&"b".into(), "e").unwrap());
        assert!(!router.unsubscribe(&"b".into(), "never-created").unwrap());
        assert_eq!(router.subscribers("e"), vec![ModuleId::from("a")]);
    }

    #[test]
    fn subscribe_requires_active_module() {
        let router = router();
        let err = router.subscribe(&"ghost".into(), "e").unwrap_err();
        assert!(matches!(err, KernelError::ModuleNotFound { .. }));
        assert_eq!(router.binding_count(), 0);
    }

    #[test]
    fn empty_event_name_is_rejected() {
        let router = router();
        init(&router, "m");
        assert!(matches!(
            router.subscribe(&"m".into(), ""),
            Err(KernelError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn init_rejects_duplicate_active_name() {
        let router = router();
        init(&router, "m");
        let err = router
            .init_module("m".into(), Echo::new("m"), Value::Null)
            .unwrap_err();
        assert!(matches!(err, KernelError::ModuleAlreadyActive { .. }));
    }

    #[test]
    fn reinit_after_dispose_gets_new_generation() {
        let router = router();
        let first = router
            .init_module("m".into(), Echo::new("m"), Value::Null)
            .unwrap();
        let old = router.module(&"m".into()).unwrap();

        router.dispose_module(&"m".into()).unwrap();
        assert_eq!(old.state(), ModuleState::Disposed);
        assert_eq!(router.module_state(&"m".into()), ModuleState::Uninitialized);

        let second = router
            .init_module("m".into(), Echo::new("m"), Value::Null)
            .unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(router.module_state(&"m".into()), ModuleState::Active);
        // The old handle stays disposed.
        assert_eq!(old.state(), ModuleState::Disposed);
    }

    #[test]
    fn stale_release_leaves_new_registration_alone() {
        let router = router();
        let first = router
            .init_module("m".into(), Echo::new("m"), Value::Null)
            .unwrap();
        router.dispose_module(&"m".into()).unwrap();
        router
            .init_module("m".into(), Echo::new("m"), Value::Null)
            .unwrap();
        router.subscribe(&"m".into(), "e").unwrap();

        assert!(!router.release(&"m".into(), first.generation));
        assert_eq!(router.subscribers("e"), vec![ModuleId::from("m")]);
    }

    #[tokio::test]
    async fn dispatch_without_binding_is_soft_failure() {
        let router = router();
        let env = envelope("unregistered/event");
        let responses = router.dispatch("unregistered/event", &env).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].statuscode, 207);
        assert_eq!(
            responses[0].detailedstatus,
            Some(DetailedStatus::NoSubscriptions)
        );
        assert_eq!(responses[0].id, env.id);
    }

    #[tokio::test]
    async fn dispatch_returns_bind_order() {
        let router = router();
        for name in ["c", "a", "b"] {
            init(&router, name);
            router.subscribe(&name.into(), "e").unwrap();
        }

        let responses = router.dispatch("e", &envelope("e")).await;
        let names: Vec<&str> = responses.iter().map(|r| r.modulename.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn dispose_removes_every_subscription() {
        let router = router();
        init(&router, "m");
        let m = ModuleId::from("m");
        router.subscribe(&m, "e1").unwrap();
        router.subscribe(&m, "e2").unwrap();

        let mut removed = router.dispose_module(&m).unwrap();
        removed.sort();
        assert_eq!(removed, ["e1", "e2"]);
        assert_eq!(router.module_count(), 0);
        // Bindings survive, empty.
        assert_eq!(router.binding_count(), 2);

        for event in ["e1", "e2"] {
            let responses = router.dispatch(event, &envelope(event)).await;
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].statuscode, 207);
        }
    }

    #[test]
    fn dispose_unknown_module_is_not_found() {
        let router = router();
        assert!(matches!(
            router.dispose_module(&"ghost".into()),
            Err(KernelError::ModuleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn closed_subscriber_is_released_after_dispatch() {
        let router = router();
        let dead = init(&router, "dead");
        init(&router, "alive");
        router.subscribe(&"dead".into(), "e").unwrap();
        router.subscribe(&"alive".into(), "e").unwrap();
        dead.close();

        let responses = router.dispatch("e", &envelope("e")).await;
        assert_eq!(responses[0].statuscode, 503);
        assert_eq!(responses[1].statuscode, 200);

        assert_eq!(router.module_state(&"dead".into()), ModuleState::Uninitialized);
        assert_eq!(router.subscribers("e"), vec![ModuleId::from("alive")]);
    }

    #[test]
    fn shutdown_blocks_new_modules_and_clear_empties_registries() {
        let router = router();
        let m = init(&router, "m");
        router.subscribe(&"m".into(), "e").unwrap();

        assert!(router.begin_shutdown());
        assert!(!router.begin_shutdown());
        assert!(matches!(
            router.init_module("late".into(), Echo::new("late"), Value::Null),
            Err(KernelError::ShuttingDown)
        ));

        assert_eq!(router.clear(), 1);
        assert_eq!(router.module_count(), 0);
        assert_eq!(router.binding_count(), 0);
        assert!(m.is_closed());
    }

    #[test]
    fn concurrent_subscribers_are_all_recorded() {
        let router = Arc::new(router());
        let names: Vec<String> = (0..16).map(|i| format!("m{i}")).collect();
        for name in &names {
            init(&router, name);
        }

        let threads: Vec<_> = names
            .iter()
            .cloned()
            .map(|name| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || router.subscribe(&name.into(), "shared").unwrap())
            })
            .collect();
        for t in threads {
            assert!(t.join().unwrap());
        }

        assert_eq!(router.subscribers("shared").len(), names.len());
    }
}
