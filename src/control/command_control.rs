//! Service control through configured shell command templates.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use super::{ServiceControl, ServiceRunState};
use crate::config::ServiceCommands;

/// Runs [`ServiceCommands`] templates through the platform shell
/// (`sh -c` on Unix, `cmd /C` on Windows).
#[derive(Debug, Clone)]
pub struct CommandServiceControl {
    commands: ServiceCommands,
}

impl CommandServiceControl {
    pub fn new(commands: ServiceCommands) -> Self {
        Self { commands }
    }

    /// Run one template; Ok(true) when it exits 0
    fn run(&self, template: &str, service: &str) -> Result<bool> {
        let line = ServiceCommands::expand(template, service);
        let status = shell(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Failed to execute service command: {line}"))?;

        log::debug!("service command `{line}` exited with {status}");
        Ok(status.success())
    }
}

impl ServiceControl for CommandServiceControl {
    fn query(&self, service: &str) -> Result<ServiceRunState> {
        if self.run(&self.commands.query_running, service)? {
            return Ok(ServiceRunState::Running);
        }
        if self.run(&self.commands.query_stopped, service)? {
            return Ok(ServiceRunState::Stopped);
        }
        Ok(ServiceRunState::Unknown)
    }

    fn start(&self, service: &str) -> Result<()> {
        if !self.run(&self.commands.start, service)? {
            anyhow::bail!("start command failed for service {service}");
        }
        Ok(())
    }

    fn stop(&self, service: &str) -> Result<()> {
        if !self.run(&self.commands.stop, service)? {
            anyhow::bail!("stop command failed for service {service}");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn shell(line: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell(line: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg(line);
    cmd
}
