//! Config artifact rendering.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::PropertySet;
use crate::error::{ProvisionError, ProvisionResult};
use crate::step::{Step, StepContext, StepOutput};

/// Write a property-list XML document to `path`.
///
/// Satisfied only when the file already holds exactly the rendered bytes, so
/// changed properties are re-rendered on the next run.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    name: String,
    path: PathBuf,
    properties: PropertySet,
}

impl RenderConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, properties: PropertySet) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            properties,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: impl ToString) -> ProvisionError {
        ProvisionError::ConfigWrite {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn rendered(&self) -> ProvisionResult<String> {
        self.properties.render().map_err(|e| match e {
            ProvisionError::ConfigWrite { reason, .. } => self.error(reason),
            other => other,
        })
    }
}

#[async_trait]
impl Step for RenderConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!(
            "render {} ({} properties)",
            self.path.display(),
            self.properties.len()
        )
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> ProvisionResult<bool> {
        if !ctx.prober.file_exists(&self.path).await {
            return Ok(false);
        }
        let expected = self.rendered()?;
        match tokio::fs::read(&self.path).await {
            Ok(current) => Ok(current == expected.as_bytes()),
            Err(_) => Ok(false),
        }
    }

    async fn apply(&self, _ctx: &StepContext) -> ProvisionResult<StepOutput> {
        let content = self.rendered()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.error(e))?;
        }

        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content.as_bytes())
            .await
            .map_err(|e| self.error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.error(e))?;

        info!(
            step = %self.name,
            path = %self.path.display(),
            properties = self.properties.len(),
            "Config written"
        );
        Ok(StepOutput::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeProber, RecordingRunner};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ctx() -> StepContext {
        StepContext::new(Arc::new(FakeProber::new()), Arc::new(RecordingRunner::new()))
    }

    fn props() -> PropertySet {
        PropertySet::new()
            .with("hbase.rootdir", "file:///data/hbase")
            .with("hbase.cluster.distributed", "false")
    }

    #[tokio::test]
    async fn test_render_then_satisfied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf/hbase-site.xml");
        let step = RenderConfig::new("render-config", &path, props());
        let ctx = ctx();

        assert!(!step.is_satisfied(&ctx).await.unwrap());
        step.apply(&ctx).await.unwrap();
        assert!(step.is_satisfied(&ctx).await.unwrap());

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, props().render().unwrap());
    }

    #[tokio::test]
    async fn test_rerender_is_byte_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hbase-site.xml");
        let step = RenderConfig::new("render-config", &path, props());

        step.apply(&ctx()).await.unwrap();
        let first = std::fs::read(&path).unwrap();
        step.apply(&ctx()).await.unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_changed_properties_not_satisfied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hbase-site.xml");
        RenderConfig::new("render-config", &path, props())
            .apply(&ctx())
            .await
            .unwrap();

        let changed = RenderConfig::new(
            "render-config",
            &path,
            props().with("hbase.cluster.distributed", "true"),
        );
        assert!(!changed.is_satisfied(&ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unwritable_path_is_config_write_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let step = RenderConfig::new("render-config", blocker.join("hbase-site.xml"), props());

        let err = step.apply(&ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "config_write");
    }
}
