//! Command lines used to hand a script to the OS scheduler or process table.
//!
//! Built as plain data so they can be checked on any host.

use std::fmt;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::update::error::LaunchError;

/// A program and its arguments, not yet run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl Invocation {
    fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run to completion; a non-zero exit is an error.
    pub fn run(&self) -> Result<Output, LaunchError> {
        which::which(self.program).map_err(|_| LaunchError::NotFound(self.program))?;

        log::debug!("running {self}");
        let output = self.command().output().map_err(|source| LaunchError::Spawn {
            program: self.program.to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(LaunchError::Failed {
                program: self.program.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// `schtasks /Delete`, idempotent with `/F`; its failure when the task does
/// not exist is ignored by the caller.
pub fn schtasks_delete(task: &str) -> Invocation {
    Invocation::new("schtasks", ["/Delete", "/TN", task, "/F"])
}

pub fn schtasks_create(task: &str, script: &Path) -> Invocation {
    let action = format!("\"{}\"", script.display());
    Invocation::new(
        "schtasks",
        [
            "/Create", "/TN", task, "/TR", action.as_str(), "/SC", "ONCE", "/ST", "00:00", "/RU", "SYSTEM",
            "/RL", "HIGHEST", "/F",
        ],
    )
}

pub fn schtasks_run(task: &str) -> Invocation {
    Invocation::new("schtasks", ["/Run", "/TN", task])
}

/// Clears a failed transient unit left by an earlier attempt so the name can
/// be reused.
pub fn systemctl_reset_failed(task: &str, user: bool) -> Invocation {
    let unit = format!("{task}.service");
    let mut args = Vec::new();
    if user {
        args.push("--user".to_string());
    }
    args.extend(["reset-failed".to_string(), unit]);
    Invocation::new("systemctl", args)
}

/// A transient unit owned by the service manager, outside the agent's cgroup.
pub fn systemd_run(task: &str, script: &Path, user: bool) -> Invocation {
    let mut args = Vec::new();
    if user {
        args.push("--user".to_string());
    }
    args.extend([
        format!("--unit={task}"),
        "--collect".to_string(),
        "--no-block".to_string(),
        "--quiet".to_string(),
        "/bin/sh".to_string(),
        script.display().to_string(),
    ]);
    Invocation::new("systemd-run", args)
}

fn cmd_line(script: &Path) -> String {
    format!("cmd.exe /C \"{}\"", script.display())
}

/// WMI `Win32_Process.Create`: the new process has no parent in our tree.
pub fn wmic_create(script: &Path) -> Invocation {
    let command_line = cmd_line(script);
    Invocation::new("wmic", ["process", "call", "create", command_line.as_str()])
}

/// The same WMI call through PowerShell CIM, for hosts without wmic.
pub fn powershell_cim_create(script: &Path) -> Invocation {
    let command_line = cmd_line(script).replace('\'', "''");
    let script = format!(
        "$r = Invoke-CimMethod -ClassName Win32_Process -MethodName Create \
         -Arguments @{{ CommandLine = '{command_line}' }}; \
         if ($r.ReturnValue -ne 0) {{ exit 1 }}; $r.ProcessId"
    );
    Invocation::new("powershell", ["-NoProfile", "-NonInteractive", "-Command", script.as_str()])
}

/// Process id reported by `wmic process call create`, if creation succeeded.
pub fn parse_wmic_output(stdout: &str) -> Option<u32> {
    let mut pid = None;
    let mut ok = false;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let value = value.trim().trim_end_matches(';').trim();
        match key.trim() {
            "ProcessId" => pid = value.parse().ok(),
            "ReturnValue" => ok = value == "0",
            _ => {}
        }
    }
    if ok { pid } else { None }
}

/// Process id printed by [`powershell_cim_create`].
pub fn parse_powershell_output(stdout: &str) -> Option<u32> {
    stdout.lines().rev().find_map(|line| line.trim().parse().ok())
}
