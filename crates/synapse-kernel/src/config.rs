//! Kernel configuration.
//!
//! Configuration is read from a TOML file (`config/default.toml` by
//! default).  A missing file, or a missing section within it, falls back to
//! built-in defaults; environment variables prefixed `SYNAPSE_` override
//! individual keys afterwards.
//!
//! ```toml
//! [kernel]
//! default_timeout_ms = 5000
//! shutdown_deadline_ms = 3000
//! log_path = "Logs/log.txt"
//! log_level = "info"
//!
//! [stream]
//! enabled = true
//! bind = "127.0.0.1:7000"
//!
//! [http]
//! enabled = false
//! bind = "127.0.0.1:8000"
//! module_host = "127.0.0.1"
//! base_port = 8000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub kernel: CoreConfig,
    pub stream: StreamConfig,
    pub http: HttpConfig,
}

/// Settings of the dispatch engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Fan-out timeout used when an envelope carries none.
    pub default_timeout_ms: u64,
    /// Upper bound on waiting for shutdown acknowledgements.
    pub shutdown_deadline_ms: u64,
    /// File that `kernel/log` appends to.
    pub log_path: PathBuf,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            shutdown_deadline_ms: 3_000,
            log_path: PathBuf::from("Logs/log.txt"),
            log_level: "info".into(),
        }
    }
}

/// Duplex-stream listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7000".into(),
        }
    }
}

/// HTTP listener and the port-per-module callback scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    /// Host the kernel uses to reach modules' own HTTP endpoints.
    pub module_host: String,
    /// Ports handed out by `kernel/init` start right after this one.
    pub base_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8000".into(),
            module_host: "127.0.0.1".into(),
            base_port: 8000,
        }
    }
}

impl KernelConfig {
    /// Load from `path`, falling back to defaults if the file is missing.
    ///
    /// Environment overrides are applied and the result validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(KernelError::Config {
                    reason: format!("{}: {e}", path.display()),
                });
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.  Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KernelError::Config {
            reason: e.to_string(),
        })
    }

    /// Apply `SYNAPSE_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("SYNAPSE_STREAM_BIND") {
            self.stream.bind = v;
        }
        if let Some(v) = lookup("SYNAPSE_HTTP_BIND") {
            self.http.bind = v;
        }
        if let Some(v) = lookup("SYNAPSE_LOG_PATH") {
            self.kernel.log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SYNAPSE_LOG_LEVEL") {
            self.kernel.log_level = v;
        }
        if let Some(v) = lookup("SYNAPSE_DEFAULT_TIMEOUT_MS") {
            self.kernel.default_timeout_ms = parse_millis("SYNAPSE_DEFAULT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("SYNAPSE_SHUTDOWN_DEADLINE_MS") {
            self.kernel.shutdown_deadline_ms = parse_millis("SYNAPSE_SHUTDOWN_DEADLINE_MS", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.stream.enabled && !self.http.enabled {
            return Err(KernelError::Config {
                reason: "at least one of [stream] or [http] must be enabled".into(),
            });
        }
        if self.kernel.default_timeout_ms == 0 {
            return Err(KernelError::Config {
                reason: "kernel.default_timeout_ms must be greater than zero".into(),
            });
        }
        if self.kernel.shutdown_deadline_ms == 0 {
            return Err(KernelError::Config {
                reason: "kernel.shutdown_deadline_ms must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.kernel.default_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.kernel.shutdown_deadline_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| KernelError::Config {
        reason: format!("{key} must be a number of milliseconds, got `{value}`"),
    })
}
