//! Side-effect free queries about host state.
//!
//! Idempotency checks ask a [`StateProber`] whether a step's effect already
//! exists. Every query answers `false` when the target is absent (or when the
//! tool used to ask is itself missing); none of them return errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::trace;

/// What `process_running` looks for: a listening local TCP port or a process
/// whose command line matches a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessTarget {
    Port(u16),
    Name(String),
}

impl From<&str> for ProcessTarget {
    fn from(value: &str) -> Self {
        match value.trim().parse::<u16>() {
            Ok(port) => ProcessTarget::Port(port),
            Err(_) => ProcessTarget::Name(value.trim().to_string()),
        }
    }
}

impl From<String> for ProcessTarget {
    fn from(value: String) -> Self {
        ProcessTarget::from(value.as_str())
    }
}

impl From<ProcessTarget> for String {
    fn from(target: ProcessTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessTarget::Port(port) => write!(f, "{}", port),
            ProcessTarget::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Pure queries used by idempotency checks.
#[async_trait]
pub trait StateProber: Send + Sync {
    /// Whether the OS package manager reports `package` as installed.
    async fn is_installed(&self, package: &str) -> bool;

    /// Whether `path` exists (file or directory).
    async fn file_exists(&self, path: &Path) -> bool;

    /// Whether a process matching `target` is alive.
    async fn process_running(&self, target: &ProcessTarget) -> bool;
}

/// Prober that inspects the real host via `dpkg-query`/`rpm`, the filesystem,
/// local TCP connects and `pgrep`.
#[derive(Debug, Clone)]
pub struct SystemProber {
    connect_timeout: Duration,
}

impl Default for SystemProber {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
        }
    }
}

impl SystemProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Run a query command, returning its stdout when it exits 0.
async fn query(exe: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        None
    }
}

#[async_trait]
impl StateProber for SystemProber {
    async fn is_installed(&self, package: &str) -> bool {
        if let Some(status) = query("dpkg-query", &["-W", "-f=${Status}", package]).await {
            trace!(package, status = %status, "dpkg status");
            return status.contains("install ok installed");
        }
        query("rpm", &["-q", package]).await.is_some()
    }

    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn process_running(&self, target: &ProcessTarget) -> bool {
        match target {
            ProcessTarget::Port(port) => matches!(
                tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect(("127.0.0.1", *port))
                )
                .await,
                Ok(Ok(_))
            ),
            ProcessTarget::Name(name) => query("pgrep", &["-f", name]).await.is_some(),
        }
    }
}
