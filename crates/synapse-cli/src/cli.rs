//! CLI argument definitions for the `synapse` binary.

use std::path::PathBuf;

use clap::Parser;

use synapse_kernel::KernelConfig;
use synapse_kernel::config::DEFAULT_CONFIG_PATH;

/// Synapse -- a micro-kernel that routes events between modules.
#[derive(Debug, Parser)]
#[command(
    name = "synapse",
    version,
    about = "Synapse -- event-routing micro-kernel",
    long_about = "Accepts module connections over a line-delimited TCP stream and/or HTTP, \
                  fans every event out to its subscribers and shuts modules down in an \
                  orderly way on termination."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Address for the duplex-stream listener (overrides `[stream].bind`).
    #[arg(long)]
    pub stream_bind: Option<String>,

    /// Address for the HTTP listener; also enables it.
    #[arg(long)]
    pub http_bind: Option<String>,

    /// Disable the duplex-stream listener.
    #[arg(long)]
    pub no_stream: bool,

    /// Disable the HTTP listener.
    #[arg(long, conflicts_with = "http_bind")]
    pub no_http: bool,

    /// Log filter used when `RUST_LOG` is unset (e.g. `info`, `synapse_kernel=debug`).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut KernelConfig) {
        if let Some(bind) = &self.stream_bind {
            config.stream.bind = bind.clone();
        }
        if let Some(bind) = &self.http_bind {
            config.http.bind = bind.clone();
            config.http.enabled = true;
        }
        if self.no_stream {
            config.stream.enabled = false;
        }
        if self.no_http {
            config.http.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.kernel.log_level = level.clone();
        }
    }
}
