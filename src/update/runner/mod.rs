//! Detached runner
//!
//! Hands a generated script to something that outlives the agent: the OS
//! task scheduler (Windows Task Scheduler, a transient systemd unit) or a
//! parent-less process. `launch` returns as soon as the handoff is accepted.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::LaunchError;
use super::script::GeneratedScript;

pub mod schedule;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use self::unix as platform;
    } else if #[cfg(windows)] {
        use self::windows as platform;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStrategy {
    /// Windows Task Scheduler, or a transient systemd unit on Linux
    ScheduledTask,
    /// WMI process creation on Windows, a new session on Unix
    DetachedProcess,
}

impl LaunchStrategy {
    /// What this host supports best.
    ///
    /// Under systemd a setsid'd child still lives in the agent's cgroup and
    /// is killed with it, so a transient unit is preferred when available.
    pub fn preferred() -> Self {
        if cfg!(windows) {
            return LaunchStrategy::ScheduledTask;
        }
        if cfg!(target_os = "linux") && which::which("systemd-run").is_ok() {
            return LaunchStrategy::ScheduledTask;
        }
        LaunchStrategy::DetachedProcess
    }

    pub fn name(self) -> &'static str {
        match self {
            LaunchStrategy::ScheduledTask => "scheduled_task",
            LaunchStrategy::DetachedProcess => "detached_process",
        }
    }
}

impl fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Proof of a successful handoff. There is nothing to wait on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchHandle {
    pub strategy: LaunchStrategy,
    pub pid: Option<u32>,
    pub task_name: Option<String>,
}

impl fmt::Display for LaunchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.strategy)?;
        if let Some(task) = &self.task_name {
            write!(f, " task={task}")?;
        }
        if let Some(pid) = self.pid {
            write!(f, " pid={pid}")?;
        }
        Ok(())
    }
}

pub trait Launcher: Send + Sync {
    fn launch(&self, script: &GeneratedScript) -> Result<LaunchHandle, LaunchError>;
}

/// Launches scripts with one configured strategy.
#[derive(Debug, Clone)]
pub struct DetachedRunner {
    strategy: LaunchStrategy,
    task_name: String,
}

impl DetachedRunner {
    pub fn new(strategy: LaunchStrategy, task_name: impl Into<String>) -> Self {
        Self {
            strategy,
            task_name: task_name.into(),
        }
    }

    pub fn strategy(&self) -> LaunchStrategy {
        self.strategy
    }
}

impl Launcher for DetachedRunner {
    fn launch(&self, script: &GeneratedScript) -> Result<LaunchHandle, LaunchError> {
        log::info!(
            "Launching {} via {}",
            script.path.display(),
            self.strategy
        );

        let handle = match self.strategy {
            LaunchStrategy::ScheduledTask => {
                platform::schedule_task(&self.task_name, &script.path)?;
                LaunchHandle {
                    strategy: self.strategy,
                    pid: None,
                    task_name: Some(self.task_name.clone()),
                }
            }
            LaunchStrategy::DetachedProcess => {
                let pid = platform::spawn_detached(&script.path)?;
                LaunchHandle {
                    strategy: self.strategy,
                    pid: Some(pid),
                    task_name: None,
                }
            }
        };

        log::info!("Update script handed off ({handle})");
        Ok(handle)
    }
}
