//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! maps onto the HTTP-like `statuscode` carried by a [`Response`], so a failure
//! can always be turned into a well-formed answer for the remote caller.
//!
//! [`Response`]: crate::envelope::Response

use crate::envelope::DetailedStatus;

/// Unified error type for the Synapse micro-kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Transport errors ---------------------------------------------------
    /// A call did not receive its response within the deadline.
    #[error("call to `{event}` timed out after {timeout_ms} ms")]
    Timeout { event: String, timeout_ms: u64 },

    /// The module's connection ended before the call could complete.
    #[error("transport to module `{module}` is closed")]
    TransportClosed { module: String },

    /// An inbound frame or payload could not be decoded.
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    // -- Registry errors ----------------------------------------------------
    /// The referenced module has no active handle.
    #[error("module not found: {module_id}")]
    ModuleNotFound { module_id: String },

    /// `init` was requested for a name that already has an active handle.
    #[error("module already active: {module_id}")]
    ModuleAlreadyActive { module_id: String },

    /// A module tried to send an event name only the kernel may emit.
    #[error("event `{event}` is reserved for the kernel")]
    ReservedEvent { event: String },

    // -- Sink errors --------------------------------------------------------
    /// Appending to the module log sink failed.
    #[error("log sink failure: {reason}")]
    SinkFailure { reason: String },

    // -- Lifecycle errors ---------------------------------------------------
    /// The kernel is shutting down and no longer accepts work.
    #[error("kernel is shutting down")]
    ShuttingDown,

    /// The configuration file or an override is invalid.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    // -- Wrapped ------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// HTTP-like status code reported to the remote caller for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            Self::TransportClosed { .. } | Self::ShuttingDown => 503,
            Self::MalformedMessage { .. } | Self::ReservedEvent { .. } | Self::Json(_) => 400,
            Self::ModuleNotFound { .. } => 404,
            Self::ModuleAlreadyActive { .. } => 409,
            Self::SinkFailure { .. } | Self::Config { .. } | Self::Io(_) | Self::Internal(_) => {
                500
            }
        }
    }

    /// The detailed status attached to error responses, if one applies.
    pub fn detailed_status(&self) -> Option<DetailedStatus> {
        match self {
            Self::Timeout { .. } => Some(DetailedStatus::Timeout),
            Self::TransportClosed { .. } => Some(DetailedStatus::TransportClosed),
            Self::MalformedMessage { .. } | Self::Json(_) => Some(DetailedStatus::MalformedMessage),
            Self::ModuleNotFound { .. } => Some(DetailedStatus::UnknownModule),
            Self::ModuleAlreadyActive { .. } => Some(DetailedStatus::ModuleAlreadyActive),
            Self::ReservedEvent { .. } => Some(DetailedStatus::ReservedEvent),
            Self::SinkFailure { .. } => Some(DetailedStatus::SinkFailure),
            Self::ShuttingDown => Some(DetailedStatus::ShuttingDown),
            Self::Config { .. } | Self::Io(_) | Self::Internal(_) => None,
        }
    }

    /// Whether this error means the module's connection is gone for good.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, Self::TransportClosed { .. })
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
