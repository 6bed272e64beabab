//! Listeners for the Synapse micro-kernel.
//!
//! This crate connects modules to a [`Router`](synapse_kernel::Router) over
//! the two supported framings:
//!
//! - **[`stream`]** -- A TCP listener carrying newline-delimited JSON in both
//!   directions.  One connection is one module; kernel calls and module
//!   requests are multiplexed over it by correlation id.
//! - **[`http`]** -- An HTTP listener where every module request is one
//!   `POST /<eventname>`, and an HTTP transport the kernel uses to call
//!   modules back on the port handed out at `kernel/init`.

pub mod error;
pub mod http;
pub mod stream;

pub use error::{GatewayError, Result};
pub use http::{HttpGateway, HttpLink, HttpTransport};
pub use stream::{StreamGateway, StreamLink, serve_connection};
