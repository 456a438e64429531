//! Daemon launch with readiness polling.
//!
//! A launch spawns the command, then polls its readiness probe with bounded
//! exponential backoff until the probe passes or the timeout expires. Each
//! probe attempt is itself capped by the remaining budget, so a hanging probe
//! cannot stretch the wait past the timeout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::error::{ProvisionError, ProvisionResult};
use crate::probe::ReadinessProbe;

/// Readiness polling schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Backoff {
    /// Delay after the first failed attempt (milliseconds).
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay (milliseconds).
    pub max_delay_ms: u64,
    /// Overall readiness budget measured from spawn (milliseconds).
    pub timeout_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            timeout_ms: 120_000,
        }
    }
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Everything needed to start one daemon.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Identifier used in logs, errors and the resulting handle.
    pub name: String,
    /// Command line (first element is the executable).
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Environment layered over the inherited one.
    pub env: BTreeMap<String, String>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub backoff: Backoff,
    /// Command run by [`ProcessHandle::shutdown`]; the child is killed when absent.
    pub stop_command: Option<Vec<String>>,
}

/// A launched, ready daemon.
///
/// Dropping a handle leaves the daemon running; only [`ProcessHandle::shutdown`]
/// stops it.
#[derive(Debug)]
pub struct ProcessHandle {
    id: String,
    pid: Option<u32>,
    child: Option<Child>,
    probe: Arc<dyn ReadinessProbe>,
    stop_command: Option<Vec<String>>,
    env: BTreeMap<String, String>,
    ready_after: u32,
}

impl ProcessHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// OS pid of the spawned command (a start script may have exited since).
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Number of probe attempts it took to become ready.
    pub fn ready_after(&self) -> u32 {
        self.ready_after
    }

    /// Re-run the readiness probe once.
    pub async fn is_ready(&self) -> bool {
        self.probe.check().await
    }

    /// Stop the daemon: run the stop command if one was configured, otherwise
    /// kill the spawned child if it is still alive.
    pub async fn shutdown(mut self) -> ProvisionResult<()> {
        if let Some(stop) = &self.stop_command {
            let Some((exe, args)) = stop.split_first() else {
                return Err(ProvisionError::LaunchFailed {
                    name: self.id.clone(),
                    reason: "empty stop command".to_string(),
                });
            };
            info!(daemon = %self.id, command = %stop.join(" "), "Stopping daemon");
            let status = Command::new(exe)
                .args(args)
                .envs(&self.env)
                .stdin(Stdio::null())
                .status()
                .await?;
            if !status.success() {
                return Err(ProvisionError::LaunchFailed {
                    name: self.id.clone(),
                    reason: format!("stop command exited with {}", status),
                });
            }
            return Ok(());
        }

        if let Some(child) = self.child.as_mut() {
            if child.try_wait()?.is_none() {
                info!(daemon = %self.id, pid = ?self.pid, "Killing daemon");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Spawns daemons and waits for them to become ready.
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Spawn `spec.command` and block until its probe passes.
    pub async fn launch(spec: LaunchSpec, cancel: &CancelFlag) -> ProvisionResult<ProcessHandle> {
        let Some((exe, args)) = spec.command.split_first() else {
            return Err(ProvisionError::LaunchFailed {
                name: spec.name,
                reason: "empty command".to_string(),
            });
        };

        info!(daemon = %spec.name, command = %spec.command.join(" "), "Launching daemon");

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| ProvisionError::LaunchFailed {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let ready_after = match Self::wait_ready(
            &spec.name,
            spec.probe.as_ref(),
            &spec.backoff,
            Some(&mut child),
            cancel,
        )
        .await
        {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(daemon = %spec.name, pid = ?pid, error = %e, "Launch abandoned");
                return Err(e);
            }
        };

        info!(daemon = %spec.name, attempts = ready_after, "Daemon ready");

        Ok(ProcessHandle {
            id: spec.name,
            pid,
            child: Some(child),
            probe: spec.probe,
            stop_command: spec.stop_command,
            env: spec.env,
            ready_after,
        })
    }

    /// Poll `probe` until it passes, returning the number of attempts used.
    ///
    /// Fails with `LaunchTimeout` once `backoff.timeout_ms` has elapsed, with
    /// `LaunchFailed` if `child` exits non-zero first, and with `Cancelled` if
    /// the flag is raised between attempts.
    pub async fn wait_ready(
        name: &str,
        probe: &dyn ReadinessProbe,
        backoff: &Backoff,
        mut child: Option<&mut Child>,
        cancel: &CancelFlag,
    ) -> ProvisionResult<u32> {
        let started = Instant::now();
        let deadline = started + backoff.timeout();
        let pid = child.as_deref().and_then(Child::id);
        let mut attempts = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let ready = tokio::time::timeout(remaining, probe.check())
                .await
                .unwrap_or(false);
            if ready {
                return Ok(attempts);
            }
            debug!(daemon = %name, attempt = attempts, probe = %probe.describe(), "Not ready yet");

            if let Some(child) = child.as_deref_mut() {
                if let Some(status) = child.try_wait()? {
                    if !status.success() {
                        return Err(ProvisionError::LaunchFailed {
                            name: name.to_string(),
                            reason: format!("exited with {} before becoming ready", status),
                        });
                    }
                }
            }

            if cancel.is_cancelled() {
                warn!(daemon = %name, "Cancelled while waiting for readiness");
                return Err(ProvisionError::Cancelled);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(backoff.delay_for(attempts).min(remaining)).await;
        }

        Err(ProvisionError::LaunchTimeout {
            name: name.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
            attempts,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct NeverReady;

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn check(&self) -> bool {
            false
        }
        fn describe(&self) -> String {
            "never".to_string()
        }
    }

    #[derive(Debug)]
    struct Hangs;

    #[async_trait]
    impl ReadinessProbe for Hangs {
        async fn check(&self) -> bool {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        }
        fn describe(&self) -> String {
            "hangs".to_string()
        }
    }

    #[derive(Debug, Default)]
    struct ReadyAfter {
        needed: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReadinessProbe for ReadyAfter {
        async fn check(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.needed
        }
        fn describe(&self) -> String {
            format!("ready after {}", self.needed)
        }
    }

    fn fast_backoff(timeout_ms: u64) -> Backoff {
        Backoff {
            initial_delay_ms: 10,
            max_delay_ms: 40,
            timeout_ms,
        }
    }

    #[test]
    fn test_backoff_default() {
        let backoff = Backoff::default();
        assert_eq!(backoff.initial_delay_ms, 250);
        assert_eq!(backoff.max_delay_ms, 5_000);
        assert_eq!(backoff.timeout_ms, 120_000);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let backoff = Backoff {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            timeout_ms: 10_000,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_partial_toml() {
        let backoff: Backoff = toml::from_str("timeout_ms = 30000").unwrap();
        assert_eq!(backoff.timeout_ms, 30_000);
        assert_eq!(backoff.initial_delay_ms, 250);
    }

    #[tokio::test]
    async fn test_wait_ready_counts_attempts() {
        let probe = ReadyAfter {
            needed: 3,
            ..ReadyAfter::default()
        };
        let attempts = ProcessLauncher::wait_ready(
            "svc",
            &probe,
            &fast_backoff(5_000),
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_never_ready_times_out() {
        let started = Instant::now();
        let err = ProcessLauncher::wait_ready(
            "svc",
            &NeverReady,
            &fast_backoff(200),
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();

        match err {
            ProvisionError::LaunchTimeout { name, attempts, .. } => {
                assert_eq!(name, "svc");
                assert!(attempts >= 2);
            }
            other => panic!("expected LaunchTimeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_hanging_probe_still_times_out() {
        let started = Instant::now();
        let err = ProcessLauncher::wait_ready(
            "svc",
            &Hangs,
            &fast_backoff(150),
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::LaunchTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_stops_between_attempts() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = ProcessLauncher::wait_ready("svc", &NeverReady, &fast_backoff(5_000), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
    }

    #[tokio::test]
    async fn test_launch_ready_daemon_and_kill() {
        let spec = LaunchSpec {
            name: "sleeper".to_string(),
            command: vec!["sleep".to_string(), "30".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            probe: Arc::new(ReadyAfter {
                needed: 1,
                ..ReadyAfter::default()
            }),
            backoff: fast_backoff(2_000),
            stop_command: None,
        };
        let handle = ProcessLauncher::launch(spec, &CancelFlag::new())
            .await
            .expect("launch failed");
        assert_eq!(handle.id(), "sleeper");
        assert!(handle.pid().is_some());
        assert_eq!(handle.ready_after(), 1);
        handle.shutdown().await.expect("shutdown failed");
    }

    #[tokio::test]
    async fn test_launch_timeout_reports_pid() {
        let spec = LaunchSpec {
            name: "stuck".to_string(),
            command: vec!["sleep".to_string(), "30".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            probe: Arc::new(NeverReady),
            backoff: fast_backoff(200),
            stop_command: None,
        };
        let err = ProcessLauncher::launch(spec, &CancelFlag::new())
            .await
            .unwrap_err();

        match err {
            ProvisionError::LaunchTimeout { pid: Some(pid), .. } => {
                let _ = std::process::Command::new("kill")
                    .arg(pid.to_string())
                    .status();
            }
            other => panic!("expected LaunchTimeout with a pid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_fails_when_child_exits_nonzero() {
        let spec = LaunchSpec {
            name: "broken".to_string(),
            command: vec!["false".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            probe: Arc::new(NeverReady),
            backoff: fast_backoff(5_000),
            stop_command: None,
        };
        let err = ProcessLauncher::launch(spec, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::LaunchFailed { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let spec = LaunchSpec {
            name: "ghost".to_string(),
            command: vec!["/nonexistent/hostprep-daemon".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            probe: Arc::new(NeverReady),
            backoff: fast_backoff(100),
            stop_command: None,
        };
        let err = ProcessLauncher::launch(spec, &CancelFlag::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "launch_failed");
    }

    #[tokio::test]
    async fn test_shutdown_runs_stop_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stopped");
        let spec = LaunchSpec {
            name: "forking".to_string(),
            command: vec!["true".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            probe: Arc::new(ReadyAfter {
                needed: 1,
                ..ReadyAfter::default()
            }),
            backoff: fast_backoff(1_000),
            stop_command: Some(vec![
                "touch".to_string(),
                marker.to_string_lossy().to_string(),
            ]),
        };
        let handle = ProcessLauncher::launch(spec, &CancelFlag::new())
            .await
            .unwrap();
        handle.shutdown().await.unwrap();
        assert!(marker.exists());
    }
}
