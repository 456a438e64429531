//! Provisioning step definitions and per-step results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancelFlag;
use crate::error::{ProvisionError, ProvisionResult};
use crate::launcher::ProcessHandle;
use crate::prober::{StateProber, SystemProber};
use crate::runner::{CommandRunner, SystemRunner};

/// What happens when a step's action fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the run immediately.
    #[default]
    Abort,

    /// Re-run the action up to `max_retries` more times, waiting
    /// `backoff_base_ms * 2^(attempt-1)` between attempts, then abort.
    Retry { max_retries: u32, backoff_base_ms: u64 },
}

impl FailurePolicy {
    /// Total number of attempts allowed (1 = no retries).
    pub fn max_attempts(&self) -> u32 {
        match self {
            FailurePolicy::Abort => 1,
            FailurePolicy::Retry { max_retries, .. } => max_retries.saturating_add(1),
        }
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Idempotency check was satisfied; action not run.
    Skipped,

    /// Action ran and succeeded.
    Succeeded,

    /// Check or action failed; the run stopped here.
    Failed,

    /// Dry run: action would have run.
    Planned,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Skipped => "skipped",
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
            StepOutcome::Planned => "planned",
        }
    }
}

/// Result of evaluating one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    /// Step name.
    pub step_name: String,

    pub outcome: StepOutcome,

    /// Error detail when `outcome` is `Failed`.
    pub error: Option<String>,

    /// Error class (see [`ProvisionError::kind`]) when `outcome` is `Failed`.
    pub error_kind: Option<String>,

    /// Number of times the action ran (0 when skipped or planned).
    pub attempts: u32,

    /// Duration in milliseconds, check included.
    pub duration_ms: u64,
}

impl RunResult {
    pub fn skipped(step_name: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(step_name, StepOutcome::Skipped, 0, duration_ms)
    }

    pub fn planned(step_name: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(step_name, StepOutcome::Planned, 0, duration_ms)
    }

    pub fn succeeded(step_name: impl Into<String>, attempts: u32, duration_ms: u64) -> Self {
        Self::new(step_name, StepOutcome::Succeeded, attempts, duration_ms)
    }

    pub fn failed(
        step_name: impl Into<String>,
        error: &ProvisionError,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            ..Self::new(step_name, StepOutcome::Failed, attempts, duration_ms)
        }
    }

    fn new(step_name: impl Into<String>, outcome: StepOutcome, attempts: u32, duration_ms: u64) -> Self {
        Self {
            step_name: step_name.into(),
            outcome,
            error: None,
            error_kind: None,
            attempts,
            duration_ms,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == StepOutcome::Failed
    }
}

/// What a successful action leaves behind.
#[derive(Debug)]
pub enum StepOutput {
    Done,
    /// A daemon the engine now owns.
    Launched(ProcessHandle),
}

/// Explicit execution environment handed to every check and action.
///
/// Variables here are applied to spawned commands only; the provisioner's own
/// process environment is never modified.
#[derive(Clone)]
pub struct StepContext {
    pub env: BTreeMap<String, String>,
    pub prober: Arc<dyn StateProber>,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancelFlag,
}

impl StepContext {
    pub fn new(prober: Arc<dyn StateProber>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            env: BTreeMap::new(),
            prober,
            runner,
            cancel: CancelFlag::new(),
        }
    }

    /// Context backed by the real host.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemProber::new()), Arc::new(SystemRunner))
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the installation home variable (e.g. `HBASE_HOME`) and prepend its
    /// `bin` directory to `PATH`.
    pub fn with_home(mut self, var: impl Into<String>, home: &Path) -> Self {
        let bin = home.join("bin");
        let base = self
            .env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        let path = if base.is_empty() {
            bin.to_string_lossy().to_string()
        } else {
            format!("{}:{}", bin.to_string_lossy(), base)
        };
        self.env
            .insert(var.into(), home.to_string_lossy().to_string());
        self.env.insert("PATH".to_string(), path);
        self
    }
}

/// A named, idempotent provisioning step.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    /// One-line description for `hostprep steps`.
    fn describe(&self) -> String {
        self.name().to_string()
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    /// Whether the step's effect already exists. Must not change host state.
    async fn is_satisfied(&self, ctx: &StepContext) -> ProvisionResult<bool>;

    /// Perform the step.
    async fn apply(&self, ctx: &StepContext) -> ProvisionResult<StepOutput>;
}
