//! Line-oriented log sink for `kernel/log`.
//!
//! Modules append free-form lines to a single file owned by the kernel.
//! Appends are serialized so concurrent writers never interleave within a
//! line.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{KernelError, Result};

/// Append-only text file shared by every module.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message`, adding a line terminator if it lacks one.
    pub async fn append(&self, message: &str) -> Result<()> {
        let line = terminate_line(message);
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| sink_failure(&self.path, e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| sink_failure(&self.path, e))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| sink_failure(&self.path, e))?;
        file.flush().await.map_err(|e| sink_failure(&self.path, e))?;

        Ok(())
    }
}

fn terminate_line(message: &str) -> String {
    let mut line = message.to_owned();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

fn sink_failure(path: &Path, error: std::io::Error) -> KernelError {
    tracing::error!(path = %path.display(), error = %error, "log sink append failed");
    KernelError::SinkFailure {
        reason: format!("{}: {error}", path.display()),
    }
}
