//! In-process backup/swap of the installed executable.
//!
//! The generated script performs the same moves on its own; this executor
//! backs the direct rollback path and artifact preparation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::error::SwapError;
use super::plan::{UpdatePlan, backup_path_for};

#[derive(Debug, Clone)]
pub struct SwapExecutor {
    current: PathBuf,
    backup: PathBuf,
}

impl SwapExecutor {
    pub fn new(current: impl Into<PathBuf>) -> Self {
        let current = current.into();
        let backup = backup_path_for(&current);
        Self { current, backup }
    }

    pub fn for_plan(plan: &UpdatePlan) -> Self {
        Self {
            current: plan.current_executable().to_path_buf(),
            backup: plan.backup_path().to_path_buf(),
        }
    }

    pub fn current(&self) -> &Path {
        &self.current
    }

    pub fn backup(&self) -> &Path {
        &self.backup
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_file()
    }

    /// current → backup, then artifact → current.
    ///
    /// A stale backup is removed first. If the second rename fails the first
    /// one is undone before the error is returned.
    pub fn install(&self, artifact: &Path) -> Result<(), SwapError> {
        if let Err(e) = remove_if_exists(&self.backup) {
            log::warn!("Failed to remove stale backup {}: {e}", self.backup.display());
        }

        fs::rename(&self.current, &self.backup).map_err(|source| SwapError::Backup {
            current: self.current.clone(),
            backup: self.backup.clone(),
            source,
        })?;

        if let Err(source) = fs::rename(artifact, &self.current) {
            if let Err(undo) = fs::rename(&self.backup, &self.current) {
                log::error!(
                    "Failed to move {} back after aborted install: {undo}",
                    self.backup.display()
                );
            }
            return Err(SwapError::Install {
                artifact: artifact.to_path_buf(),
                current: self.current.clone(),
                source,
            });
        }

        log::info!("Installed {} as {}", artifact.display(), self.current.display());
        Ok(())
    }

    /// backup → current, replacing whatever is installed.
    pub fn restore(&self) -> Result<(), SwapError> {
        if !self.has_backup() {
            return Err(SwapError::NoBackup(self.backup.clone()));
        }

        let restore_err = |source| SwapError::Restore {
            backup: self.backup.clone(),
            current: self.current.clone(),
            source,
        };

        remove_if_exists(&self.current).map_err(restore_err)?;
        fs::rename(&self.backup, &self.current).map_err(restore_err)?;

        log::info!("Restored {} from {}", self.current.display(), self.backup.display());
        Ok(())
    }

    pub fn discard_backup(&self) -> io::Result<()> {
        remove_if_exists(&self.backup)
    }
}

/// Make a downloaded artifact runnable once it is moved into place.
pub fn prepare_artifact(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }

    #[cfg(not(unix))]
    {
        fs::metadata(path)?;
    }

    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
