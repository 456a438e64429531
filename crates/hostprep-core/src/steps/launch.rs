//! Long-running daemon launch.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProvisionResult;
use crate::launcher::{Backoff, LaunchSpec, ProcessLauncher};
use crate::probe::{ProbeSpec, ReadinessProbe};
use crate::prober::ProcessTarget;
use crate::step::{Step, StepContext, StepOutput};

/// Upper bound for the single probe attempt made by the idempotency check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Start a daemon and wait for its readiness probe.
///
/// Satisfied when the prober already sees `running` alive, or, when no
/// target is configured, when the readiness probe passes right now.
#[derive(Debug, Clone)]
pub struct LaunchDaemon {
    name: String,
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    running: Option<ProcessTarget>,
    probe: ProbeSpec,
    backoff: Backoff,
    stop_command: Option<Vec<String>>,
}

impl LaunchDaemon {
    pub fn new(name: impl Into<String>, command: Vec<String>, probe: ProbeSpec) -> Self {
        Self {
            name: name.into(),
            command,
            working_dir: None,
            running: None,
            probe,
            backoff: Backoff::default(),
            stop_command: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn running(mut self, target: ProcessTarget) -> Self {
        self.running = Some(target);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn stop_command(mut self, command: Vec<String>) -> Self {
        self.stop_command = Some(command);
        self
    }
}

#[async_trait]
impl Step for LaunchDaemon {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!(
            "launch `{}` (ready when {})",
            self.command.join(" "),
            self.probe.describe()
        )
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> ProvisionResult<bool> {
        match &self.running {
            Some(target) => Ok(ctx.prober.process_running(target).await),
            None => {
                let limit = CHECK_TIMEOUT.min(self.backoff.timeout());
                Ok(tokio::time::timeout(limit, self.probe.check())
                    .await
                    .unwrap_or(false))
            }
        }
    }

    async fn apply(&self, ctx: &StepContext) -> ProvisionResult<StepOutput> {
        let spec = LaunchSpec {
            name: self.name.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            env: ctx.env.clone(),
            probe: Arc::new(self.probe.clone()),
            backoff: self.backoff.clone(),
            stop_command: self.stop_command.clone(),
        };
        let handle = ProcessLauncher::launch(spec, &ctx.cancel).await?;
        Ok(StepOutput::Launched(handle))
    }
}
