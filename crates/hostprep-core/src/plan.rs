//! TOML provisioning plans.
//!
//! A plan names the packages, artifact, config document and daemons of one
//! host role and expands into a [`StepRegistry`] in a fixed order:
//! install, download, extract, render, then one launch step per daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::PropertySet;
use crate::engine::StepRegistry;
use crate::error::{ProvisionError, ProvisionResult};
use crate::launcher::Backoff;
use crate::probe::ProbeSpec;
use crate::prober::ProcessTarget;
use crate::step::{FailurePolicy, StepContext};
use crate::steps::{Download, Extract, InstallPackages, LaunchDaemon, PackageManager, RenderConfig};

/// Built-in plan: single-node HBase plus the Thrift2 gateway.
pub const BUILTIN_PLAN: &str = include_str!("../plans/storage-node.toml");

pub const INSTALL_STEP: &str = "install-packages";
pub const DOWNLOAD_STEP: &str = "download-artifact";
pub const EXTRACT_STEP: &str = "extract-artifact";
pub const RENDER_STEP: &str = "render-config";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub name: String,

    #[serde(default)]
    pub environment: EnvironmentSection,

    pub packages: Option<PackagesSection>,

    pub artifact: Option<ArtifactSection>,

    pub config: Option<ConfigSection>,

    #[serde(default, rename = "daemon")]
    pub daemons: Vec<DaemonSection>,
}

/// Variables handed to launched commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSection {
    /// Variable naming the installation home, e.g. `HBASE_HOME`.
    pub home_var: Option<String>,
    pub home_dir: Option<PathBuf>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackagesSection {
    /// Detected from the host when omitted.
    pub manager: Option<PackageManager>,
    pub names: Vec<String>,
    #[serde(default)]
    pub refresh_index: bool,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSection {
    pub url: String,
    pub dest: PathBuf,
    /// Directory to unpack into; no extract step when omitted.
    pub extract_into: Option<PathBuf>,
    /// Path the archive creates. Defaults to `environment.home_dir`.
    pub creates: Option<PathBuf>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    pub path: PathBuf,
    #[serde(default, rename = "property")]
    pub properties: PropertySet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Port number or process name that marks the daemon as already up.
    pub running: Option<ProcessTarget>,
    pub probe: ProbeSpec,
    #[serde(default)]
    pub backoff: Backoff,
    pub stop_command: Option<Vec<String>>,
}

impl DaemonSection {
    pub fn step_name(&self) -> String {
        format!("launch-{}", self.name)
    }
}

impl Plan {
    pub fn from_toml_str(s: &str) -> ProvisionResult<Self> {
        let plan: Plan = toml::from_str(s)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> ProvisionResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::InvalidPlan(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn builtin() -> ProvisionResult<Self> {
        Self::from_toml_str(BUILTIN_PLAN)
    }

    fn validate(&self) -> ProvisionResult<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidPlan("plan name is empty".to_string()));
        }
        if let Some(packages) = &self.packages {
            if packages.names.is_empty() {
                return Err(ProvisionError::InvalidPlan(
                    "packages.names is empty".to_string(),
                ));
            }
        }
        if self.environment.home_var.is_some() != self.environment.home_dir.is_some() {
            return Err(ProvisionError::InvalidPlan(
                "environment.home_var and environment.home_dir must be set together".to_string(),
            ));
        }
        for daemon in &self.daemons {
            if daemon.command.is_empty() {
                return Err(ProvisionError::InvalidPlan(format!(
                    "daemon {} has an empty command",
                    daemon.name
                )));
            }
        }
        Ok(())
    }

    /// Layer this plan's environment over `base`.
    pub fn step_context(&self, base: StepContext) -> StepContext {
        let mut ctx = self
            .environment
            .vars
            .iter()
            .fold(base, |ctx, (k, v)| ctx.with_var(k.clone(), v.clone()));
        if let (Some(var), Some(dir)) = (&self.environment.home_var, &self.environment.home_dir) {
            ctx = ctx.with_home(var.clone(), dir);
        }
        ctx
    }

    /// Render the config document, if the plan has one.
    pub fn render_config(&self) -> ProvisionResult<Option<String>> {
        self.config
            .as_ref()
            .map(|config| config.properties.render())
            .transpose()
    }

    /// Expand into steps.
    pub fn build_registry(&self) -> ProvisionResult<StepRegistry> {
        let mut registry = StepRegistry::new();

        if let Some(packages) = &self.packages {
            let manager = packages
                .manager
                .or_else(PackageManager::detect)
                .ok_or_else(|| {
                    ProvisionError::InvalidPlan(
                        "no supported package manager found; set packages.manager".to_string(),
                    )
                })?;
            registry.register(Box::new(
                InstallPackages::new(INSTALL_STEP, manager, packages.names.clone())
                    .refresh_index(packages.refresh_index)
                    .with_policy(packages.on_failure.clone()),
            ))?;
        }

        if let Some(artifact) = &self.artifact {
            registry.register(Box::new(
                Download::new(DOWNLOAD_STEP, artifact.url.clone(), artifact.dest.clone())
                    .with_policy(artifact.on_failure.clone()),
            ))?;

            if let Some(into) = &artifact.extract_into {
                let creates = artifact
                    .creates
                    .clone()
                    .or_else(|| self.environment.home_dir.clone())
                    .ok_or_else(|| {
                        ProvisionError::InvalidPlan(
                            "artifact.creates or environment.home_dir is required to extract"
                                .to_string(),
                        )
                    })?;
                registry.register(Box::new(Extract::new(
                    EXTRACT_STEP,
                    artifact.dest.clone(),
                    into.clone(),
                    creates,
                )))?;
            }
        }

        if let Some(config) = &self.config {
            registry.register(Box::new(RenderConfig::new(
                RENDER_STEP,
                config.path.clone(),
                config.properties.clone(),
            )))?;
        }

        for daemon in &self.daemons {
            let mut step = LaunchDaemon::new(
                daemon.step_name(),
                daemon.command.clone(),
                daemon.probe.clone(),
            )
            .backoff(daemon.backoff.clone());
            if let Some(dir) = &daemon.working_dir {
                step = step.working_dir(dir.clone());
            }
            if let Some(target) = &daemon.running {
                step = step.running(target.clone());
            }
            if let Some(stop) = &daemon.stop_command {
                step = step.stop_command(stop.clone());
            }
            registry.register(Box::new(step))?;
        }

        Ok(registry)
    }
}
