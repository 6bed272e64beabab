//! Synapse micro-kernel.
//!
//! The dispatch engine at the centre of a module-based application.  Modules
//! connect to the kernel, subscribe to event names and send events; the
//! kernel fans every event out to its subscribers and hands back their
//! answers in subscription order.
//!
//! - **[`envelope`]** -- Wire types: requests, responses, reserved event
//!   names and the line framing used on duplex streams.
//! - **[`transport`]** -- Correlated request/response channels to single
//!   modules, including the duplex-stream [`StreamTransport`].
//! - **[`binding`]** -- Ordered, duplicate-free subscriber sets and the
//!   concurrent fan-out over them.
//! - **[`router`]** -- The module and binding registries and the operations
//!   that mutate them.
//! - **[`control`]** -- Interception of `kernel/*` event names before
//!   dispatch.
//! - **[`shutdown`]** -- One-shot, deadline-bounded shutdown broadcast.
//! - **[`sink`]** -- The line-oriented file behind `kernel/log`.
//! - **[`config`]** -- TOML configuration with environment overrides.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod binding;
pub mod config;
pub mod control;
pub mod envelope;
pub mod error;
pub mod module;
pub mod router;
pub mod shutdown;
pub mod sink;
pub mod transport;

// Re-export the most commonly used types at the crate root for convenience.
pub use binding::Delegate;
pub use config::KernelConfig;
pub use control::{Attachment, Link};
pub use envelope::{
    CorrelationId, DetailedStatus, Envelope, Frame, ModuleId, Reply, Response,
};
pub use error::{KernelError, Result};
pub use module::{ModuleDescriptor, ModuleHandle, ModuleInfo, ModuleState};
pub use router::Router;
pub use shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownTrigger};
pub use sink::LogSink;
pub use transport::{CallRequest, ModuleTransport, StreamTransport, TransportStats};
