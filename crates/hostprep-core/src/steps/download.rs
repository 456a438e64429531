//! Artifact download over HTTP(S).

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{ProvisionError, ProvisionResult};
use crate::step::{FailurePolicy, Step, StepContext, StepOutput};

/// Fetch `url` to `dest`; satisfied when `dest` exists.
///
/// The body is streamed into `<dest>.part` and renamed on completion, so an
/// interrupted download never leaves a file at `dest`.
#[derive(Debug, Clone)]
pub struct Download {
    name: String,
    url: String,
    dest: PathBuf,
    timeout_secs: u64,
    policy: FailurePolicy,
}

impl Download {
    pub fn new(name: impl Into<String>, url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            dest: dest.into(),
            timeout_secs: 3_600,
            policy: FailurePolicy::Abort,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn error(&self, reason: impl ToString) -> ProvisionError {
        ProvisionError::Download {
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    async fn fetch(&self, part: &Path) -> ProvisionResult<u64> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| self.error(e))?;

        let mut response = client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.error(e))?;

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| self.error(format!("create {}: {}", part.display(), e)))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.error(e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| self.error(format!("write {}: {}", part.display(), e)))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| self.error(e))?;
        Ok(written)
    }
}

/// `<path>.part`
fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl Step for Download {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("download {} -> {}", self.url, self.dest.display())
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy.clone()
    }

    async fn is_satisfied(&self, ctx: &StepContext) -> ProvisionResult<bool> {
        Ok(ctx.prober.file_exists(&self.dest).await)
    }

    async fn apply(&self, _ctx: &StepContext) -> ProvisionResult<StepOutput> {
        if let Some(parent) = self.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.error(format!("create {}: {}", parent.display(), e)))?;
        }

        let part = part_path(&self.dest);
        info!(step = %self.name, url = %self.url, dest = %self.dest.display(), "Downloading artifact");

        match self.fetch(&part).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, &self.dest)
                    .await
                    .map_err(|e| self.error(format!("rename {}: {}", part.display(), e)))?;
                info!(step = %self.name, bytes, "Download complete");
                Ok(StepOutput::Done)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}
