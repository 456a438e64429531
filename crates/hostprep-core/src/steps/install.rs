//! OS package installation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{ProvisionError, ProvisionResult};
use crate::runner::CommandSpec;
use crate::step::{FailurePolicy, Step, StepContext, StepOutput};

/// Supported package managers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Yum,
    Dnf,
}

impl PackageManager {
    /// Pick the first package manager found on this host.
    pub fn detect() -> Option<Self> {
        [
            ("/usr/bin/apt-get", PackageManager::Apt),
            ("/usr/bin/dnf", PackageManager::Dnf),
            ("/usr/bin/yum", PackageManager::Yum),
        ]
        .into_iter()
        .find(|(path, _)| Path::new(path).exists())
        .map(|(_, manager)| manager)
    }

    /// Command refreshing the package index, if the manager needs one.
    pub fn refresh_command(&self) -> Option<CommandSpec> {
        match self {
            PackageManager::Apt => Some(
                CommandSpec::new(["apt-get", "update", "-q"])
                    .with_env("DEBIAN_FRONTEND", "noninteractive"),
            ),
            PackageManager::Yum | PackageManager::Dnf => None,
        }
    }

    pub fn install_command(&self, packages: &[String]) -> CommandSpec {
        let mut argv: Vec<String> = match self {
            PackageManager::Apt => vec!["apt-get".into(), "install".into(), "-y".into(), "-q".into()],
            PackageManager::Yum => vec!["yum".into(), "install".into(), "-y".into()],
            PackageManager::Dnf => vec!["dnf".into(), "install".into(), "-y".into()],
        };
        argv.extend(packages.iter().cloned());
        let spec = CommandSpec::new(argv);
        match self {
            PackageManager::Apt => spec.with_env("DEBIAN_FRONTEND", "noninteractive"),
            _ => spec,
        }
    }
}

/// Install a set of packages; satisfied when every package is installed.
#[derive(Debug, Clone)]
pub struct InstallPackages {
    name: String,
    manager: PackageManager,
    packages: Vec<String>,
    refresh_index: bool,
    timeout_secs: u64,
    policy: FailurePolicy,
}

impl InstallPackages {
    pub fn new(name: impl Into<String>, manager: PackageManager, packages: Vec<String>) -> Self {
        Self {
            name: name.into(),
            manager,
            packages,
            refresh_index: false,
            timeout_secs: 1_800,
            policy: FailurePolicy::Abort,
        }
    }

    /// Refresh the package index before installing.
    pub fn refresh_index(mut self, refresh: bool) -> Self {
        self.refresh_index = refresh;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn run(&self, ctx: &StepContext, spec: CommandSpec) -> ProvisionResult<()> {
        let spec = spec.with_timeout(self.timeout_secs);
        let output = ctx
            .runner
            .run(&spec)
            .await
            .map_err(|e| self.error(e.to_string()))?;
        if !output.passed() {
            return Err(self.error(format!(
                "`{}` exited with code {}: {}",
                spec.display(),
                output.exit_code,
                output.diagnostic()
            )));
        }
        Ok(())
    }

    fn error(&self, reason: String) -> ProvisionError {
        ProvisionError::PackageInstall {
            packages: self.packages.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Step for InstallPackages {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("install {} via {:?}", self.packages.join(", "), self.manager)
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy.clone()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> ProvisionResult<bool> {
        for package in &self.packages {
            if !ctx.prober.is_installed(package).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn apply(&self, ctx: &StepContext) -> ProvisionResult<StepOutput> {
        if self.refresh_index {
            if let Some(refresh) = self.manager.refresh_command() {
                info!(step = %self.name, "Refreshing package index");
                self.run(ctx, refresh).await?;
            }
        }

        // Only ask for what is missing.
        let mut missing = Vec::new();
        for package in &self.packages {
            if !ctx.prober.is_installed(package).await {
                missing.push(package.clone());
            }
        }
        if missing.is_empty() {
            return Ok(StepOutput::Done);
        }

        info!(step = %self.name, packages = ?missing, "Installing packages");
        self.run(ctx, self.manager.install_command(&missing)).await?;
        Ok(StepOutput::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeProber, RecordingRunner};
    use std::sync::Arc;

    fn setup() -> (Arc<FakeProber>, Arc<RecordingRunner>, StepContext) {
        let prober = Arc::new(FakeProber::new());
        let runner = Arc::new(RecordingRunner::new());
        let ctx = StepContext::new(prober.clone(), runner.clone());
        (prober, runner, ctx)
    }

    #[test]
    fn test_install_commands() {
        let pkgs = vec!["openjdk-8-jdk".to_string()];
        let apt = PackageManager::Apt.install_command(&pkgs);
        assert_eq!(apt.display(), "apt-get install -y -q openjdk-8-jdk");
        assert_eq!(apt.env["DEBIAN_FRONTEND"], "noninteractive");

        let yum = PackageManager::Yum.install_command(&pkgs);
        assert_eq!(yum.display(), "yum install -y openjdk-8-jdk");
        assert!(PackageManager::Yum.refresh_command().is_none());
    }

    #[tokio::test]
    async fn test_satisfied_when_all_installed() {
        let (prober, _, ctx) = setup();
        let step = InstallPackages::new(
            "install-packages",
            PackageManager::Apt,
            vec!["a".to_string(), "b".to_string()],
        );
        prober.mark_installed("a");
        assert!(!step.is_satisfied(&ctx).await.unwrap());
        prober.mark_installed("b");
        assert!(step.is_satisfied(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_installs_only_missing() {
        let (prober, runner, ctx) = setup();
        prober.mark_installed("a");
        let step = InstallPackages::new(
            "install-packages",
            PackageManager::Apt,
            vec!["a".to_string(), "b".to_string()],
        )
        .refresh_index(true);

        step.apply(&ctx).await.unwrap();
        assert_eq!(
            runner.executed_lines(),
            vec!["apt-get update -q", "apt-get install -y -q b"]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_package_install_error() {
        let (_, runner, ctx) = setup();
        runner.push_failure(100, "E: Unable to locate package nope");
        let step = InstallPackages::new("install", PackageManager::Apt, vec!["nope".to_string()]);

        let err = step.apply(&ctx).await.unwrap_err();
        match err {
            ProvisionError::PackageInstall { packages, reason } => {
                assert_eq!(packages, vec!["nope".to_string()]);
                assert!(reason.contains("Unable to locate package"));
            }
            other => panic!("expected PackageInstall, got {:?}", other),
        }
    }
}
