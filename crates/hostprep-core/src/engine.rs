//! Step registry and the fail-fast execution engine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ProvisionError, ProvisionResult};
use crate::launcher::ProcessHandle;
use crate::step::{FailurePolicy, RunResult, Step, StepContext, StepOutcome, StepOutput};

/// Ordered list of uniquely named steps.
#[derive(Default)]
pub struct StepRegistry {
    steps: Vec<Box<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. Names must be unique.
    pub fn register(&mut self, step: Box<dyn Step>) -> ProvisionResult<()> {
        if self.position(step.name()).is_some() {
            return Err(ProvisionError::DuplicateStep(step.name().to_string()));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Builder form of [`StepRegistry::register`].
    pub fn with_step(mut self, step: impl Step + 'static) -> ProvisionResult<Self> {
        self.register(Box::new(step))?;
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// SHA-256 over the ordered step names (order sensitive).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.steps {
            hasher.update(step.name().as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Evaluate checks only; never run actions.
    pub dry_run: bool,

    /// Start at this step; earlier steps are neither checked nor recorded.
    pub from_step: Option<String>,
}

/// Result of a complete run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,

    /// Digest of the ordered step names.
    pub plan_digest: String,

    pub dry_run: bool,

    /// One entry per evaluated step, in order. Stops at the first failure.
    pub results: Vec<RunResult>,

    /// No step failed and the run was not cancelled.
    pub success: bool,

    /// Cancellation was observed before a step started.
    pub cancelled: bool,

    pub duration_ms: u64,

    /// `<kind>: <message>` of the error that stopped the run.
    pub terminal_error: Option<String>,

    /// The error that stopped the run.
    #[serde(skip)]
    pub error: Option<ProvisionError>,
}

impl RunReport {
    pub fn outcomes(&self) -> Vec<StepOutcome> {
        self.results.iter().map(|r| r.outcome).collect()
    }

    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// The failed step, if any.
    pub fn failed_step(&self) -> Option<&RunResult> {
        self.results.iter().find(|r| r.is_failure())
    }
}

/// Runs a registry strictly in order, one step at a time.
pub struct ExecutionEngine {
    registry: StepRegistry,
    handles: Vec<ProcessHandle>,
}

impl ExecutionEngine {
    pub fn new(registry: StepRegistry) -> Self {
        Self {
            registry,
            handles: Vec::new(),
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Daemons launched so far, in launch order.
    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    /// Execute the registry.
    ///
    /// For each step the idempotency check runs first; a satisfied check
    /// records `Skipped`. Otherwise the action runs (subject to the step's
    /// failure policy). The first failure is recorded and ends the run, so a
    /// failure at step k yields exactly k results.
    ///
    /// Only an unknown `from_step` is returned as `Err`; step failures and
    /// cancellation are reported through [`RunReport`].
    pub async fn run(&mut self, ctx: &StepContext, options: &RunOptions) -> ProvisionResult<RunReport> {
        let start_index = match &options.from_step {
            Some(name) => self
                .registry
                .position(name)
                .ok_or_else(|| ProvisionError::UnknownStep(name.clone()))?,
            None => 0,
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let plan_digest = self.registry.digest();

        info!(
            run_id = %run_id,
            steps = self.registry.len() - start_index,
            dry_run = options.dry_run,
            "Starting provisioning run"
        );

        let mut results = Vec::new();
        let mut cancelled = false;
        let mut error = None;

        for step in &self.registry.steps[start_index..] {
            if ctx.cancel.is_cancelled() {
                warn!(step = %step.name(), "Cancelled before step");
                cancelled = true;
                error = Some(ProvisionError::Cancelled);
                break;
            }

            let step_start = Instant::now();
            let satisfied = match step.is_satisfied(ctx).await {
                Ok(satisfied) => satisfied,
                Err(e) => {
                    warn!(step = %step.name(), error = %e, "Idempotency check failed");
                    results.push(RunResult::failed(step.name(), &e, 0, elapsed_ms(step_start)));
                    error = Some(e);
                    break;
                }
            };

            if satisfied {
                info!(step = %step.name(), outcome = "skipped", "Already satisfied");
                results.push(RunResult::skipped(step.name(), elapsed_ms(step_start)));
                continue;
            }

            if options.dry_run {
                info!(step = %step.name(), outcome = "planned", "Would run");
                results.push(RunResult::planned(step.name(), elapsed_ms(step_start)));
                continue;
            }

            info!(step = %step.name(), "Executing step");
            let (outcome, attempts) = apply_with_policy(step.as_ref(), ctx).await;
            let duration_ms = elapsed_ms(step_start);

            match outcome {
                Ok(output) => {
                    info!(step = %step.name(), outcome = "succeeded", duration_ms, "Step complete");
                    if let StepOutput::Launched(handle) = output {
                        self.handles.push(handle);
                    }
                    results.push(RunResult::succeeded(step.name(), attempts, duration_ms));
                }
                Err(e) => {
                    warn!(step = %step.name(), outcome = "failed", error = %e, duration_ms, "Step failed");
                    if matches!(e, ProvisionError::Cancelled) {
                        cancelled = true;
                    }
                    results.push(RunResult::failed(step.name(), &e, attempts, duration_ms));
                    error = Some(e);
                    break;
                }
            }
        }

        let success = error.is_none();
        let duration_ms = elapsed_ms(started);
        if success {
            info!(run_id = %run_id, duration_ms, "Provisioning run completed successfully");
        } else {
            info!(run_id = %run_id, duration_ms, "Provisioning run failed");
        }

        Ok(RunReport {
            run_id,
            started_at,
            plan_digest,
            dry_run: options.dry_run,
            results,
            success,
            cancelled,
            duration_ms,
            terminal_error: error.as_ref().map(|e| format!("{}: {}", e.kind(), e)),
            error,
        })
    }

    /// Shut down every owned daemon, most recently launched first.
    ///
    /// All handles are attempted; the first error is returned.
    pub async fn shutdown_all(&mut self) -> ProvisionResult<()> {
        let mut first_error = None;
        while let Some(handle) = self.handles.pop() {
            let id = handle.id().to_string();
            if let Err(e) = handle.shutdown().await {
                warn!(daemon = %id, error = %e, "Shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run a step's action, retrying only when its policy says so.
async fn apply_with_policy(
    step: &dyn Step,
    ctx: &StepContext,
) -> (ProvisionResult<StepOutput>, u32) {
    let policy = step.failure_policy();
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        let result = step.apply(ctx).await;
        let retryable = !matches!(result, Err(ProvisionError::Cancelled)) && !ctx.cancel.is_cancelled();
        match (result, &policy) {
            (Ok(output), _) => return (Ok(output), attempt),
            (Err(e), FailurePolicy::Retry { backoff_base_ms, .. })
                if attempt < max_attempts && retryable =>
            {
                let delay = Duration::from_millis(
                    backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(32)),
                );
                warn!(
                    step = %step.name(),
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Step failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            (Err(e), _) => return (Err(e), attempt),
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
