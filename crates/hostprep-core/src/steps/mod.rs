//! Built-in provisioning steps.
//!
//! Each step pairs an idempotency check (via the context's prober) with a
//! single-purpose action, and maps failures onto its own error class.

pub mod download;
pub mod extract;
pub mod install;
pub mod launch;
pub mod render;

pub use download::Download;
pub use extract::Extract;
pub use install::{InstallPackages, PackageManager};
pub use launch::LaunchDaemon;
pub use render::RenderConfig;
