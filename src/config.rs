use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::update::runner::LaunchStrategy;
use crate::update::script::{ScriptDialect, ScriptSettings};

/// Top‑level updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Name of the managed service hosting the agent
    pub service_name: String,
    /// Directory for the generated script, its log and the status file
    pub state_dir: Option<String>,
    /// How the script is detached; unset picks the platform preference
    pub launch_strategy: Option<LaunchStrategy>,
    /// Scheduled task / transient unit name
    pub task_name: String,
    pub grace_period_secs: u32,
    pub stop_wait_secs: u32,
    pub start_wait_secs: u32,
    pub probe_timeout_secs: u64,
    pub probe_interval_ms: u64,
    /// Overrides the platform's default service commands (script and `status`)
    pub service_commands: Option<ServiceCommands>,
    pub status_file: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            service_name: "agent".into(),
            state_dir: None,
            launch_strategy: None,
            task_name: "AgentSelfUpdate".into(),
            grace_period_secs: 3,
            stop_wait_secs: 2,
            start_wait_secs: 3,
            probe_timeout_secs: 10,
            probe_interval_ms: 500,
            service_commands: None,
            status_file: None,
        }
    }
}

impl UpdaterConfig {
    /// Load config from disk, writing the defaults first if the file is missing
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Config not found at {}, creating default configuration", path.display());

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }

            let default_toml = toml::to_string_pretty(&UpdaterConfig::default())
                .context("Failed to serialize default config")?;
            fs::write(path, default_toml).context("Failed to write config file")?;
        }

        let cfg_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: UpdaterConfig = toml::from_str(&cfg_str)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        Ok(cfg)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir().join(format!("{}-update.log", self.service_name))
    }

    pub fn status_path(&self) -> PathBuf {
        self.status_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_dir().join("update-status.json"))
    }

    pub fn launch_strategy(&self) -> LaunchStrategy {
        self.launch_strategy.unwrap_or_else(LaunchStrategy::preferred)
    }

    pub fn service_commands(&self, dialect: ScriptDialect) -> ServiceCommands {
        self.service_commands
            .clone()
            .unwrap_or_else(|| ServiceCommands::for_dialect(dialect))
    }

    pub fn script_settings(&self, dialect: ScriptDialect) -> ScriptSettings {
        ScriptSettings {
            dialect,
            commands: self.service_commands(dialect),
            grace_period_secs: self.grace_period_secs,
            stop_wait_secs: self.stop_wait_secs,
            start_wait_secs: self.start_wait_secs,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}

/// Shell command templates used to drive the managed service.
///
/// Every template may contain `{service}`, replaced by the validated service
/// name when a script is generated or a command is run in-process. The query
/// templates must exit 0 when the service is in the named state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommands {
    pub query_stopped: String,
    pub query_running: String,
    pub stop: String,
    pub start: String,
}

impl ServiceCommands {
    pub const SERVICE_PLACEHOLDER: &'static str = "{service}";

    /// systemd units in the manager this process belongs to: the system
    /// manager for root, the user manager otherwise
    pub fn systemd() -> Self {
        Self::systemd_for(running_as_root())
    }

    pub fn systemd_for(root: bool) -> Self {
        let systemctl = if root { "systemctl" } else { "systemctl --user" };
        Self {
            query_stopped: format!(
                "{systemctl} show -p ActiveState --value '{{service}}' | grep -Eq '^(inactive|failed)$'"
            ),
            query_running: format!("{systemctl} is-active --quiet '{{service}}'"),
            stop: format!("{systemctl} stop '{{service}}'"),
            start: format!("{systemctl} start '{{service}}'"),
        }
    }

    /// Windows services through sc.exe / net.exe
    pub fn windows_scm() -> Self {
        Self {
            query_stopped: r#"sc query "{service}" | find "STOPPED" > nul"#.into(),
            query_running: r#"sc query "{service}" | find "RUNNING" > nul"#.into(),
            stop: r#"net stop "{service}" /y > nul 2>&1"#.into(),
            start: r#"net start "{service}" > nul 2>&1"#.into(),
        }
    }

    pub fn for_dialect(dialect: ScriptDialect) -> Self {
        match dialect {
            ScriptDialect::Batch => Self::windows_scm(),
            ScriptDialect::Posix => Self::systemd(),
        }
    }

    pub fn expand(template: &str, service: &str) -> String {
        template.replace(Self::SERVICE_PLACEHOLDER, service)
    }

    /// All four templates with the placeholder substituted
    pub fn for_service(&self, service: &str) -> Self {
        Self {
            query_stopped: Self::expand(&self.query_stopped, service),
            query_running: Self::expand(&self.query_running, service),
            stop: Self::expand(&self.stop, service),
            start: Self::expand(&self.start, service),
        }
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::getuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}

/// Default config file location
///
/// `system` selects the machine-wide file instead of the per-user one.
pub fn default_config_path(system: bool) -> Result<PathBuf> {
    if system {
        #[cfg(target_os = "windows")]
        let path = PathBuf::from(r"C:\ProgramData\AgentUpdater\updater.toml");

        #[cfg(not(target_os = "windows"))]
        let path = PathBuf::from("/etc/agent-updater/updater.toml");

        return Ok(path);
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("agent-updater");
    Ok(config_dir.join("updater.toml"))
}

fn default_state_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    let dir = PathBuf::from("/var/lib/agent-updater");

    #[cfg(target_os = "windows")]
    let dir = PathBuf::from(r"C:\ProgramData\AgentUpdater\update");

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    let dir = dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("agent-updater");

    dir
}
