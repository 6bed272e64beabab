//! Gateway error types.

use synapse_kernel::KernelError;

/// Unified error type for the Synapse listeners.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The listener could not bind its address.
    #[error("failed to bind `{addr}`: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Accepting or serving a connection failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Convenience alias used throughout the gateway crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
