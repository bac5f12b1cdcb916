//! Self-update orchestration for an agent running under a service manager.
//!
//! - [`control`]: query/start/stop the managed service
//! - [`health`]: bounded run-state probing
//! - [`update`]: plans, scripts, detached launch and the orchestrator
//! - [`config`]: TOML configuration

pub mod config;
pub mod control;
pub mod health;
pub mod update;

pub use config::UpdaterConfig;
pub use control::{ServiceControl, ServiceRunState};
pub use update::{Orchestrator, UpdateError, UpdateOutcome, UpdateState};
