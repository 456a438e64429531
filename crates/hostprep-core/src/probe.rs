//! Readiness probes for launched daemons.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::net::TcpStream;
use tokio::process::Command;

/// A single readiness check. One call is one attempt; the launcher owns the
/// retry schedule and the overall deadline.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + Debug {
    /// Returns `true` once the daemon accepts requests.
    async fn check(&self) -> bool;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Declarative probe as written in plan files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// TCP connect succeeds.
    Tcp { host: String, port: u16 },

    /// A log file contains `pattern`.
    LogLine { path: PathBuf, pattern: String },

    /// HTTP GET returns a 2xx status.
    Http { url: String },

    /// Command exits 0.
    Command { argv: Vec<String> },
}

impl ProbeSpec {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ProbeSpec::Tcp {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl ReadinessProbe for ProbeSpec {
    async fn check(&self) -> bool {
        match self {
            ProbeSpec::Tcp { host, port } => {
                TcpStream::connect((host.as_str(), *port)).await.is_ok()
            }
            ProbeSpec::LogLine { path, pattern } => match tokio::fs::read(path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).contains(pattern.as_str()),
                Err(_) => false,
            },
            ProbeSpec::Http { url } => match reqwest::get(url).await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            },
            ProbeSpec::Command { argv } => {
                let Some((exe, args)) = argv.split_first() else {
                    return false;
                };
                Command::new(exe)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await
                    .map(|status| status.success())
                    .unwrap_or(false)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            ProbeSpec::Tcp { host, port } => format!("tcp {}:{}", host, port),
            ProbeSpec::LogLine { path, pattern } => {
                format!("log line {:?} in {}", pattern, path.display())
            }
            ProbeSpec::Http { url } => format!("http {}", url),
            ProbeSpec::Command { argv } => format!("command `{}`", argv.join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every request with `status` and an empty body.
    async fn serve_status(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/status", addr)
    }

    #[test]
    fn test_probe_spec_from_toml() {
        let probe: ProbeSpec = toml::from_str(
            r#"
kind = "log_line"
path = "/var/log/hbase/master.log"
pattern = "Master has completed initialization"
"#,
        )
        .unwrap();
        assert_eq!(
            probe,
            ProbeSpec::LogLine {
                path: PathBuf::from("/var/log/hbase/master.log"),
                pattern: "Master has completed initialization".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(ProbeSpec::tcp("127.0.0.1", port).check().await);
        drop(listener);
        assert!(!ProbeSpec::tcp("127.0.0.1", port).check().await);
    }

    #[tokio::test]
    async fn test_log_line_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let probe = ProbeSpec::LogLine {
            path: path.clone(),
            pattern: "ready to serve".to_string(),
        };

        assert!(!probe.check().await, "missing log file is not ready");

        std::fs::write(&path, "starting\n").unwrap();
        assert!(!probe.check().await);

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"ready to serve on 9090\n").await.unwrap();
        file.flush().await.unwrap();
        assert!(probe.check().await);
    }

    #[tokio::test]
    async fn test_command_probe() {
        let ok = ProbeSpec::Command {
            argv: vec!["true".to_string()],
        };
        let fail = ProbeSpec::Command {
            argv: vec!["false".to_string()],
        };
        let empty = ProbeSpec::Command { argv: vec![] };
        assert!(ok.check().await);
        assert!(!fail.check().await);
        assert!(!empty.check().await);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = ProbeSpec::Http {
            url: format!("http://127.0.0.1:{}/health", port),
        };
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn test_http_probe_success_status() {
        let probe = ProbeSpec::Http {
            url: serve_status("200 OK").await,
        };
        assert!(probe.check().await);
    }

    #[tokio::test]
    async fn test_http_probe_server_error_not_ready() {
        let probe = ProbeSpec::Http {
            url: serve_status("503 Service Unavailable").await,
        };
        assert!(!probe.check().await);
    }

    #[test]
    fn test_describe() {
        assert_eq!(ProbeSpec::tcp("localhost", 9090).describe(), "tcp localhost:9090");
        let probe = ProbeSpec::Command {
            argv: vec!["hbase".to_string(), "status".to_string()],
        };
        assert_eq!(probe.describe(), "command `hbase status`");
    }
}
