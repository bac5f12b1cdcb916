//! Managed service control - delegates to OS-native service managers
//!
//! Provides a unified interface for querying, starting and stopping the
//! service that hosts the agent:
//! - Linux: systemd (systemctl)
//! - Windows: Service Control Manager (Windows API)
//!
//! [`CommandServiceControl`] runs the configured command templates through the
//! platform shell instead, for supervisors without a native backend.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

mod command_control;

pub use command_control::CommandServiceControl;

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux_control;
        use linux_control as platform;
    } else if #[cfg(target_os = "windows")] {
        mod windows_control;
        use windows_control as platform;
    }
}

/// Run state of the managed service, as reported by a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRunState {
    /// Transitional, missing, or unreadable
    Unknown,
    Stopped,
    Running,
}

impl fmt::Display for ServiceRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceRunState::Unknown => "unknown",
            ServiceRunState::Stopped => "stopped",
            ServiceRunState::Running => "running",
        };
        f.write_str(s)
    }
}

/// Backend able to query and drive a named service.
pub trait ServiceControl: Send + Sync {
    fn query(&self, service: &str) -> Result<ServiceRunState>;
    fn start(&self, service: &str) -> Result<()>;
    fn stop(&self, service: &str) -> Result<()>;
}

/// The host's native service manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemServiceControl;

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl ServiceControl for SystemServiceControl {
    fn query(&self, service: &str) -> Result<ServiceRunState> {
        platform::query_state(service)
    }

    fn start(&self, service: &str) -> Result<()> {
        platform::start_service(service)
    }

    fn stop(&self, service: &str) -> Result<()> {
        platform::stop_service(service)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
impl ServiceControl for SystemServiceControl {
    fn query(&self, _service: &str) -> Result<ServiceRunState> {
        anyhow::bail!("no native service manager backend on this platform; configure service_commands")
    }

    fn start(&self, _service: &str) -> Result<()> {
        anyhow::bail!("no native service manager backend on this platform; configure service_commands")
    }

    fn stop(&self, _service: &str) -> Result<()> {
        anyhow::bail!("no native service manager backend on this platform; configure service_commands")
    }
}
