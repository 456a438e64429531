//! In-memory fakes for the host-facing traits (testing only)
//!
//! `FakeProber` and `RecordingRunner` satisfy the `StateProber` and
//! `CommandRunner` contracts without touching packages, files or processes.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::prober::{ProcessTarget, StateProber};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

// ---------------------------------------------------------------------------
// FakeProber
// ---------------------------------------------------------------------------

/// Prober answering from in-memory sets.
///
/// `file_exists` also consults the real filesystem so steps that write files
/// into a temp dir are observed.
#[derive(Debug, Default)]
pub struct FakeProber {
    installed: Mutex<HashSet<String>>,
    files: Mutex<HashSet<PathBuf>>,
    running: Mutex<HashSet<ProcessTarget>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_installed(&self, package: &str) {
        self.installed.lock().unwrap().insert(package.to_string());
    }

    pub fn add_file(&self, path: impl Into<PathBuf>) {
        self.files.lock().unwrap().insert(path.into());
    }

    pub fn set_running(&self, target: ProcessTarget) {
        self.running.lock().unwrap().insert(target);
    }
}

#[async_trait]
impl StateProber for FakeProber {
    async fn is_installed(&self, package: &str) -> bool {
        self.installed.lock().unwrap().contains(package)
    }

    async fn file_exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains(path) || path.exists()
    }

    async fn process_running(&self, target: &ProcessTarget) -> bool {
        self.running.lock().unwrap().contains(target)
    }
}

// ---------------------------------------------------------------------------
// RecordingRunner
// ---------------------------------------------------------------------------

/// Runner that records every command and replies from a queue of canned
/// outputs (exit 0 with empty output once the queue is drained).
#[derive(Debug, Default)]
pub struct RecordingRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    commands: Mutex<Vec<CommandSpec>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<CommandOutput>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failing reply with the given exit code and stderr.
    pub fn push_failure(&self, exit_code: i32, stderr: &str) {
        self.responses.lock().unwrap().push_back(CommandOutput {
            exit_code,
            stderr: stderr.to_string(),
            ..CommandOutput::default()
        });
    }

    /// Commands run so far, in order.
    pub fn executed(&self) -> Vec<CommandSpec> {
        self.commands.lock().unwrap().clone()
    }

    /// Command lines run so far, space-joined.
    pub fn executed_lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::display)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.commands.lock().unwrap().push(spec.clone());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}
