//! Lifting write protection from the install directory before a swap.

use std::path::Path;
use std::process::{Command, Stdio};

use super::error::ProtectionError;

pub trait ProtectionToggle: Send + Sync {
    /// Best-effort; callers log failures and carry on.
    fn disable_protections(&self, install_dir: &Path, service_label: &str) -> Result<(), ProtectionError>;
}

/// Hosts that do not lock down the install directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtection;

impl ProtectionToggle for NoProtection {
    fn disable_protections(&self, _install_dir: &Path, _service_label: &str) -> Result<(), ProtectionError> {
        Ok(())
    }
}

/// Resets the install directory's ACLs to inherited defaults with `icacls`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AclReset;

impl ProtectionToggle for AclReset {
    fn disable_protections(&self, install_dir: &Path, service_label: &str) -> Result<(), ProtectionError> {
        const PROGRAM: &str = "icacls";

        log::info!(
            "Resetting ACLs on {} for {service_label}",
            install_dir.display()
        );
        let status = Command::new(PROGRAM)
            .arg(install_dir)
            .args(["/reset", "/T", "/Q"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| ProtectionError::Spawn {
                program: PROGRAM,
                source,
            })?;

        if !status.success() {
            return Err(ProtectionError::Failed {
                program: PROGRAM,
                status,
            });
        }
        Ok(())
    }
}

pub fn default_protection() -> Box<dyn ProtectionToggle> {
    if cfg!(windows) {
        Box::new(AclReset)
    } else {
        Box::new(NoProtection)
    }
}
