//! Module handles.
//!
//! A [`ModuleHandle`] is the kernel's record of one connected module: its
//! stable [`ModuleId`], the [`ModuleTransport`] used to reach it, and its
//! lifecycle state.
//!
//! ```text
//! Uninitialized  --init-->  Active  --dispose / transport loss / shutdown-->  Disposed
//! ```
//!
//! A disposed handle never becomes active again; the module must `init`
//! afresh, which creates a new handle with a new generation number.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ModuleId;
use crate::transport::{ModuleTransport, TransportStats};

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    /// No handle has been created (or the id is unknown to the kernel).
    Uninitialized,
    /// Registered and reachable.
    Active,
    /// Removed from the registry; the handle is only kept alive by
    /// in-flight work.
    Disposed,
}

/// The kernel's handle on one connected module.
pub struct ModuleHandle {
    id: ModuleId,
    generation: u64,
    transport: Arc<dyn ModuleTransport>,
    registered_at: DateTime<Utc>,
    disposed: AtomicBool,
}

impl ModuleHandle {
    pub(crate) fn new(id: ModuleId, generation: u64, transport: Arc<dyn ModuleTransport>) -> Self {
        Self {
            id,
            generation,
            transport,
            registered_at: Utc::now(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// Distinguishes successive handles registered under the same id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport(&self) -> &Arc<dyn ModuleTransport> {
        &self.transport
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn state(&self) -> ModuleState {
        if self.disposed.load(Ordering::Acquire) {
            ModuleState::Disposed
        } else {
            ModuleState::Active
        }
    }

    /// Transition to `Disposed`.  Returns `false` if already disposed.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// A serializable snapshot of this handle.
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id.clone(),
            generation: self.generation,
            transport: self.transport.kind(),
            state: self.state(),
            registered_at: self.registered_at,
            stats: self.transport.stats(),
        }
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Snapshot of a registered module, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub generation: u64,
    pub transport: &'static str,
    pub state: ModuleState,
    pub registered_at: DateTime<Utc>,
    pub stats: TransportStats,
}

/// What `init` hands back to the module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleDescriptor {
    pub module_id: ModuleId,
    pub generation: u64,
    /// How the kernel will reach the module (a port, or the acknowledged id).
    pub address: Value,
}
