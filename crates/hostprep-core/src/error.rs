//! Error types for hostprep

use thiserror::Error;

/// Errors that can occur while provisioning a host.
///
/// Any of these aborts the run; no rollback of partially created state is
/// attempted.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The package manager could not install one or more packages
    #[error("failed to install packages {packages:?}: {reason}")]
    PackageInstall {
        packages: Vec<String>,
        reason: String,
    },

    /// Artifact download failed
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    /// Archive extraction failed
    #[error("failed to extract {archive}: {reason}")]
    Extract { archive: String, reason: String },

    /// Config artifact could not be rendered or written
    #[error("failed to write config {path}: {reason}")]
    ConfigWrite { path: String, reason: String },

    /// Readiness probe never succeeded within the launch timeout
    #[error(
        "{name} not ready after {waited_ms}ms ({attempts} probe attempt(s)){}",
        .pid.map(|pid| format!(", pid {} left running", pid)).unwrap_or_default()
    )]
    LaunchTimeout {
        name: String,
        waited_ms: u64,
        attempts: u32,
        /// Spawned process, which is not stopped on timeout.
        pid: Option<u32>,
    },

    /// Daemon could not be spawned or exited with an error before becoming ready
    #[error("{name} failed to start: {reason}")]
    LaunchFailed { name: String, reason: String },

    /// `--from-step` named a step that is not registered
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Two steps registered under the same name
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    /// Plan file is malformed or inconsistent
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Run was cancelled externally
    #[error("run cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Stable snake_case identifier of the error class, used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::PackageInstall { .. } => "package_install",
            ProvisionError::Download { .. } => "download",
            ProvisionError::Extract { .. } => "extract",
            ProvisionError::ConfigWrite { .. } => "config_write",
            ProvisionError::LaunchTimeout { .. } => "launch_timeout",
            ProvisionError::LaunchFailed { .. } => "launch_failed",
            ProvisionError::UnknownStep(_) => "unknown_step",
            ProvisionError::DuplicateStep(_) => "duplicate_step",
            ProvisionError::InvalidPlan(_) => "invalid_plan",
            ProvisionError::Cancelled => "cancelled",
            ProvisionError::Io(_) => "io",
        }
    }
}

impl From<toml::de::Error> for ProvisionError {
    fn from(err: toml::de::Error) -> Self {
        ProvisionError::InvalidPlan(err.to_string())
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;
