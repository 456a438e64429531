//! Archive extraction via `tar`.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use crate::error::{ProvisionError, ProvisionResult};
use crate::runner::CommandSpec;
use crate::step::{Step, StepContext, StepOutput};

/// Unpack a gzipped tarball into `into`; satisfied when `creates` exists.
#[derive(Debug, Clone)]
pub struct Extract {
    name: String,
    archive: PathBuf,
    into: PathBuf,
    creates: PathBuf,
}

impl Extract {
    pub fn new(
        name: impl Into<String>,
        archive: impl Into<PathBuf>,
        into: impl Into<PathBuf>,
        creates: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            archive: archive.into(),
            into: into.into(),
            creates: creates.into(),
        }
    }

    fn error(&self, reason: String) -> ProvisionError {
        ProvisionError::Extract {
            archive: self.archive.display().to_string(),
            reason,
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new([
            "tar".to_string(),
            "-xzf".to_string(),
            self.archive.to_string_lossy().to_string(),
            "-C".to_string(),
            self.into.to_string_lossy().to_string(),
        ])
    }
}

#[async_trait]
impl Step for Extract {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("extract {} into {}", self.archive.display(), self.into.display())
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> ProvisionResult<bool> {
        Ok(ctx.prober.file_exists(&self.creates).await)
    }

    async fn apply(&self, ctx: &StepContext) -> ProvisionResult<StepOutput> {
        if !ctx.prober.file_exists(&self.archive).await {
            return Err(self.error("archive not found".to_string()));
        }
        tokio::fs::create_dir_all(&self.into)
            .await
            .map_err(|e| self.error(format!("create {}: {}", self.into.display(), e)))?;

        let spec = self.command();
        info!(step = %self.name, command = %spec.display(), "Extracting archive");
        let output = ctx
            .runner
            .run(&spec)
            .await
            .map_err(|e| self.error(e.to_string()))?;
        if !output.passed() {
            return Err(self.error(format!(
                "tar exited with code {}: {}",
                output.exit_code,
                output.diagnostic()
            )));
        }

        if !ctx.prober.file_exists(&self.creates).await {
            return Err(self.error(format!(
                "archive did not create {}",
                self.creates.display()
            )));
        }
        Ok(StepOutput::Done)
    }
}
