//! hostprep - idempotent host provisioning
//!
//! Provides a provisioning engine that:
//! - Runs named steps strictly in order, skipping those whose effect exists
//! - Stops at the first failure and reports the partial results
//! - Launches daemons and waits on readiness probes instead of fixed sleeps
//! - Loads host plans from TOML (with a built-in single-node HBase plan)

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod launcher;
pub mod plan;
pub mod probe;
pub mod prober;
pub mod runner;
pub mod step;
pub mod steps;
pub mod telemetry;

// Re-export key types
pub use cancel::CancelFlag;
pub use config::{render_configuration, Property, PropertySet};
pub use engine::{ExecutionEngine, RunOptions, RunReport, StepRegistry};
pub use error::{ProvisionError, ProvisionResult};
pub use launcher::{Backoff, LaunchSpec, ProcessHandle, ProcessLauncher};
pub use plan::{Plan, BUILTIN_PLAN};
pub use probe::{ProbeSpec, ReadinessProbe};
pub use prober::{ProcessTarget, StateProber, SystemProber};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use step::{FailurePolicy, RunResult, Step, StepContext, StepOutcome, StepOutput};
pub use telemetry::init_tracing;
