//! Linux service control using systemd (systemctl)

use std::process::Command;

use anyhow::{Context, Result};

use super::ServiceRunState;

/// Query the unit via systemctl is-active
///
/// is-active prints the ActiveState and exits 0 only for "active", so the
/// printed state is parsed rather than the exit code.
pub fn query_state(service: &str) -> Result<ServiceRunState> {
    let unit = unit_name(service);
    let output = systemctl()
        .args(["is-active", &unit])
        .output()
        .context("Failed to execute systemctl is-active")?;

    Ok(parse_active_state(&String::from_utf8_lossy(&output.stdout)))
}

/// Start the unit via systemctl start
pub fn start_service(service: &str) -> Result<()> {
    run_systemctl("start", service)
}

/// Stop the unit via systemctl stop
pub fn stop_service(service: &str) -> Result<()> {
    run_systemctl("stop", service)
}

fn run_systemctl(verb: &str, service: &str) -> Result<()> {
    let unit = unit_name(service);
    let output = systemctl()
        .args([verb, &unit])
        .output()
        .with_context(|| format!("Failed to execute systemctl {verb}"))?;

    if !output.status.success() {
        anyhow::bail!(
            "Failed to {verb} {unit}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

fn systemctl() -> Command {
    let mut cmd = Command::new("systemctl");
    if !is_root() {
        cmd.arg("--user");
    }
    cmd
}

fn parse_active_state(stdout: &str) -> ServiceRunState {
    match stdout.trim() {
        "active" | "reloading" => ServiceRunState::Running,
        "inactive" | "failed" => ServiceRunState::Stopped,
        _ => ServiceRunState::Unknown,
    }
}

fn unit_name(service: &str) -> String {
    if service.ends_with(".service") {
        service.to_string()
    } else {
        format!("{service}.service")
    }
}

/// Check if running as root
#[inline]
fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}
